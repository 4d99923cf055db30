//! Stub lowering
//!
//! Translates a [`StubProgram`] into x86-64 machine code with iced-x86's
//! `CodeAssembler`. Handler and resume addresses are emitted as 8-byte
//! literals after the code and reached through `[rip+slot]`, so a stub works
//! wherever it is placed. Displaced instructions are decoded and handed back
//! to the assembler, which re-encodes RIP-relative operands and relative
//! branches for the new location.

use iced_x86::code_asm::*;
use iced_x86::{Decoder, DecoderError, DecoderOptions};

use super::ir::{Cond, Gpr, Mem, Op, Resume, StubProgram, Width};
use super::StubError;

/// Everything a program refers to that is only known at placement time.
#[derive(Debug, Clone, Copy)]
pub struct LowerEnv<'a> {
    /// Address the code will run at
    pub origin: usize,
    /// Bytes replayed by [`Op::Displaced`]
    pub displaced: &'a [u8],
    /// Address the displaced bytes were read from
    pub displaced_at: usize,
    pub handler: Option<usize>,
    /// Value loaded by [`Op::LoadContext`]
    pub context: usize,
    pub continue_at: Option<usize>,
    pub alternate_at: Option<usize>,
}

impl LowerEnv<'_> {
    fn resume(&self, resume: Resume) -> Option<usize> {
        match resume {
            Resume::Continue => self.continue_at,
            Resume::Alternate => self.alternate_at,
        }
    }
}

/// Lower `program` to machine code placed at `env.origin`.
pub fn lower(program: &StubProgram, env: &LowerEnv<'_>) -> Result<Vec<u8>, StubError> {
    check_references(program, env)?;

    let mut a = CodeAssembler::new(64)?;
    let mut labels: Vec<CodeLabel> = (0..program.label_count()).map(|_| a.create_label()).collect();

    let mut handler_slot = a.create_label();
    let mut continue_slot = a.create_label();
    let mut alternate_slot = a.create_label();

    for op in program.ops() {
        match *op {
            Op::Displaced => relocate_displaced(&mut a, env.displaced, env.displaced_at)?,
            Op::Load { dst, src } => a.mov(reg64(dst), qword_ptr(mem(src)))?,
            Op::Move { dst, src } => a.mov(reg64(dst), reg64(src))?,
            Op::Lea { dst, src } => a.lea(reg64(dst), mem(src))?,
            Op::Imul { dst, src, imm } => a.imul_3(reg64(dst), reg64(src), imm)?,
            Op::LoadContext(dst) => a.mov(reg64(dst), env.context as u64)?,
            Op::StoreStack { disp, src } => a.mov(qword_ptr(rsp + disp), reg64(src))?,
            Op::Push(reg) => a.push(reg64(reg))?,
            Op::Pop(reg) => a.pop(reg64(reg))?,
            Op::AllocStack(size) => a.sub(rsp, size)?,
            Op::FreeStack(size) => a.add(rsp, size)?,
            Op::CmpByte { mem: operand, imm } => a.cmp(byte_ptr(mem(operand)), i32::from(imm))?,
            Op::CmpDword { reg, imm } => a.cmp(reg32(reg), imm)?,
            Op::CmpDwordMem { reg, mem: operand } => a.cmp(reg32(reg), dword_ptr(mem(operand)))?,
            Op::Test { reg, width } => match width {
                Width::Byte => a.test(reg8(reg), reg8(reg))?,
                Width::Dword => a.test(reg32(reg), reg32(reg))?,
                Width::Qword => a.test(reg64(reg), reg64(reg))?,
            },
            Op::Branch { cond, to } => {
                let target = *labels.get(to.0).ok_or(StubError::UnknownLabel(to.0))?;
                match cond {
                    Cond::Equal => a.je(target)?,
                    Cond::NotEqual => a.jne(target)?,
                }
            }
            Op::Jump(to) => {
                let target = *labels.get(to.0).ok_or(StubError::UnknownLabel(to.0))?;
                a.jmp(target)?;
            }
            Op::Bind(label) => {
                let target = labels
                    .get_mut(label.0)
                    .ok_or(StubError::UnknownLabel(label.0))?;
                a.set_label(target)?;
            }
            Op::CallHandler => a.call(qword_ptr(handler_slot))?,
            Op::JumpHandler => a.jmp(qword_ptr(handler_slot))?,
            Op::Exit(Resume::Continue) => a.jmp(qword_ptr(continue_slot))?,
            Op::Exit(Resume::Alternate) => a.jmp(qword_ptr(alternate_slot))?,
        }
    }

    // Literal pool
    if let Some(handler) = env.handler.filter(|_| program.uses_handler()) {
        a.set_label(&mut handler_slot)?;
        a.dq(&[handler as u64])?;
    }
    if let Some(target) = env.continue_at.filter(|_| program.uses_resume(Resume::Continue)) {
        a.set_label(&mut continue_slot)?;
        a.dq(&[target as u64])?;
    }
    if let Some(target) = env.alternate_at.filter(|_| program.uses_resume(Resume::Alternate)) {
        a.set_label(&mut alternate_slot)?;
        a.dq(&[target as u64])?;
    }

    Ok(a.assemble(env.origin as u64)?)
}

fn check_references(program: &StubProgram, env: &LowerEnv<'_>) -> Result<(), StubError> {
    if program.uses_handler() && env.handler.is_none() {
        return Err(StubError::MissingHandler);
    }
    if program.uses_displaced() && env.displaced.is_empty() {
        return Err(StubError::NothingDisplaced);
    }
    for resume in [Resume::Continue, Resume::Alternate] {
        if program.uses_resume(resume) && env.resume(resume).is_none() {
            return Err(StubError::MissingResume(resume));
        }
    }
    Ok(())
}

/// Decode the displaced bytes and add them to the assembler as instructions.
fn relocate_displaced(a: &mut CodeAssembler, bytes: &[u8], address: usize) -> Result<(), StubError> {
    let start = address as u64;
    let end = start + bytes.len() as u64;
    let mut decoder = Decoder::with_ip(64, bytes, start, DecoderOptions::NONE);
    let mut decoded = 0usize;

    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => StubError::SplitInstruction {
                    decoded,
                    len: bytes.len(),
                },
                _ => StubError::Undecodable {
                    address: address + decoded,
                },
            });
        }

        let is_branch = instruction.is_jcc_short_or_near()
            || instruction.is_jmp_short_or_near()
            || instruction.is_call_near();
        if is_branch && (start..end).contains(&instruction.near_branch_target()) {
            return Err(StubError::InternalBranch {
                address: address + decoded,
            });
        }

        decoded += instruction.len();
        a.add_instruction(instruction)?;
    }

    if decoded != bytes.len() {
        return Err(StubError::SplitInstruction {
            decoded,
            len: bytes.len(),
        });
    }
    Ok(())
}

fn mem(operand: Mem) -> AsmMemoryOperand {
    let base = reg64(operand.base);
    match operand.index {
        Some(index) => base + reg64(index) + operand.disp,
        None => base + operand.disp,
    }
}

fn reg64(reg: Gpr) -> AsmRegister64 {
    match reg {
        Gpr::Rax => rax,
        Gpr::Rcx => rcx,
        Gpr::Rdx => rdx,
        Gpr::Rbx => rbx,
        Gpr::Rsp => rsp,
        Gpr::Rbp => rbp,
        Gpr::Rsi => rsi,
        Gpr::Rdi => rdi,
        Gpr::R8 => r8,
        Gpr::R9 => r9,
        Gpr::R10 => r10,
        Gpr::R11 => r11,
        Gpr::R12 => r12,
        Gpr::R13 => r13,
        Gpr::R14 => r14,
        Gpr::R15 => r15,
    }
}

fn reg32(reg: Gpr) -> AsmRegister32 {
    match reg {
        Gpr::Rax => eax,
        Gpr::Rcx => ecx,
        Gpr::Rdx => edx,
        Gpr::Rbx => ebx,
        Gpr::Rsp => esp,
        Gpr::Rbp => ebp,
        Gpr::Rsi => esi,
        Gpr::Rdi => edi,
        Gpr::R8 => r8d,
        Gpr::R9 => r9d,
        Gpr::R10 => r10d,
        Gpr::R11 => r11d,
        Gpr::R12 => r12d,
        Gpr::R13 => r13d,
        Gpr::R14 => r14d,
        Gpr::R15 => r15d,
    }
}

fn reg8(reg: Gpr) -> AsmRegister8 {
    match reg {
        Gpr::Rax => al,
        Gpr::Rcx => cl,
        Gpr::Rdx => dl,
        Gpr::Rbx => bl,
        Gpr::Rsp => spl,
        Gpr::Rbp => bpl,
        Gpr::Rsi => sil,
        Gpr::Rdi => dil,
        Gpr::R8 => r8b,
        Gpr::R9 => r9b,
        Gpr::R10 => r10b,
        Gpr::R11 => r11b,
        Gpr::R12 => r12b,
        Gpr::R13 => r13b,
        Gpr::R14 => r14b,
        Gpr::R15 => r15b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::ir::Gpr;
    use iced_x86::{Instruction, Mnemonic, Register};

    const SITE: usize = 0x1_4000_1000;
    const ORIGIN: usize = 0x1_4100_0000;

    fn env(displaced: &[u8]) -> LowerEnv<'_> {
        LowerEnv {
            origin: ORIGIN,
            displaced,
            displaced_at: SITE,
            handler: Some(0x1_4200_0000),
            context: 0x0000_7FF0_1234_5678,
            continue_at: Some(SITE + 6),
            alternate_at: Some(SITE + 0x24),
        }
    }

    fn decode(bytes: &[u8], count: usize) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(64, bytes, ORIGIN as u64, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() && out.len() < count {
            out.push(decoder.decode());
        }
        out
    }

    /// Value of the 8-byte literal an indirect `jmp`/`call` reads
    fn literal(bytes: &[u8], instruction: &Instruction) -> usize {
        assert!(instruction.is_ip_rel_memory_operand());
        let offset = instruction.ip_rel_memory_address() as usize - ORIGIN;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(word) as usize
    }

    #[test]
    fn test_relocated_prologue() {
        // push rsi; push rdi; push r12; push r14
        let displaced = [0x40, 0x56, 0x57, 0x41, 0x54, 0x41, 0x56];
        let mut lower_env = env(&displaced);
        lower_env.continue_at = Some(SITE + 7);
        let bytes = lower(&StubProgram::relocation(), &lower_env).unwrap();

        let code = decode(&bytes, 5);
        let mnemonics: Vec<_> = code.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            mnemonics,
            [Mnemonic::Push, Mnemonic::Push, Mnemonic::Push, Mnemonic::Push, Mnemonic::Jmp]
        );
        assert_eq!(code[0].op0_register(), Register::RSI);
        assert_eq!(code[3].op0_register(), Register::R14);
        assert_eq!(literal(&bytes, &code[4]), SITE + 7);
    }

    #[test]
    fn test_rip_relative_operand_keeps_target() {
        // mov rax, [rip+0x10]
        let displaced = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let bytes = lower(&StubProgram::relocation(), &env(&displaced)).unwrap();

        let code = decode(&bytes, 1);
        assert_eq!(code[0].mnemonic(), Mnemonic::Mov);
        assert_eq!(code[0].ip_rel_memory_address() as usize, SITE + 7 + 0x10);
    }

    #[test]
    fn test_relative_branch_keeps_target() {
        // cmp byte [rbp+0x6F], 0; jne +0x1E
        let displaced = [0x80, 0x7D, 0x6F, 0x00, 0x75, 0x1E];
        let bytes = lower(&StubProgram::relocation(), &env(&displaced)).unwrap();

        let code = decode(&bytes, 2);
        assert_eq!(code[0].mnemonic(), Mnemonic::Cmp);
        assert_eq!(code[1].mnemonic(), Mnemonic::Jne);
        assert_eq!(code[1].near_branch_target() as usize, SITE + 0x24);
    }

    #[test]
    fn test_split_instruction_rejected() {
        // mov rax, [rip+disp32] cut after two displacement bytes
        let displaced = [0x48, 0x8B, 0x05, 0x10, 0x00];
        let err = lower(&StubProgram::relocation(), &env(&displaced)).unwrap_err();
        assert!(matches!(err, StubError::SplitInstruction { len: 5, .. }));
    }

    #[test]
    fn test_branch_into_displaced_region_rejected() {
        // jmp +0 (to the nop right after it); nop
        let displaced = [0xEB, 0x00, 0x90];
        let err = lower(&StubProgram::relocation(), &env(&displaced)).unwrap_err();
        assert!(matches!(err, StubError::InternalBranch { address } if address == SITE));
    }

    #[test]
    fn test_missing_alternate_resume() {
        let mut program = StubProgram::new();
        program.exit(Resume::Alternate);
        let mut lower_env = env(&[]);
        lower_env.alternate_at = None;
        assert!(matches!(
            lower(&program, &lower_env),
            Err(StubError::MissingResume(Resume::Alternate))
        ));
    }

    #[test]
    fn test_missing_handler() {
        let mut program = StubProgram::new();
        program.call_handler().exit(Resume::Continue);
        let mut lower_env = env(&[]);
        lower_env.handler = None;
        assert!(matches!(lower(&program, &lower_env), Err(StubError::MissingHandler)));
    }

    #[test]
    fn test_unbound_label_from_other_program() {
        let mut other = StubProgram::new();
        let _ = other.label();
        let foreign = other.label();

        let mut program = StubProgram::new();
        program.jump(foreign).exit(Resume::Continue);
        assert!(matches!(
            lower(&program, &env(&[])),
            Err(StubError::UnknownLabel(1))
        ));
    }

    #[test]
    fn test_handler_call_and_selected_resume() {
        // test rax, rax; je skip; mov rsi, rax; exit continue; skip: exit alternate
        let mut program = StubProgram::new();
        let skip = program.label();
        program
            .load_context(Gpr::R9)
            .call_handler()
            .test(Gpr::Rax, Width::Qword)
            .branch(Cond::Equal, skip)
            .mov(Gpr::Rsi, Gpr::Rax)
            .exit(Resume::Continue)
            .bind(skip)
            .exit(Resume::Alternate);
        let lower_env = env(&[]);
        let bytes = lower(&program, &lower_env).unwrap();

        let code = decode(&bytes, 7);
        assert_eq!(code[0].mnemonic(), Mnemonic::Mov);
        assert_eq!(code[0].op0_register(), Register::R9);
        assert_eq!(code[0].immediate64() as usize, lower_env.context);
        assert_eq!(code[1].mnemonic(), Mnemonic::Call);
        assert_eq!(literal(&bytes, &code[1]), 0x1_4200_0000);
        assert_eq!(code[3].mnemonic(), Mnemonic::Je);
        assert_eq!(code[3].near_branch_target(), code[6].ip());
        assert_eq!(literal(&bytes, &code[5]), SITE + 6);
        assert_eq!(literal(&bytes, &code[6]), SITE + 0x24);
    }

    #[test]
    fn test_memory_forms() {
        let mut program = StubProgram::new();
        program
            .load(Gpr::Rdx, Mem::indexed(Gpr::Rcx, Gpr::Rdx, 0x10))
            .imul(Gpr::Rdx, Gpr::R14, 0x78)
            .cmp_byte(Gpr::Rcx.at(0x1A), 0x3E)
            .cmp_dword_mem(Gpr::R14, Gpr::R8.at(0x138))
            .lea(Gpr::R9, Gpr::Rbp.at(-0x38))
            .exit(Resume::Continue);
        let bytes = lower(&program, &env(&[])).unwrap();

        let code = decode(&bytes, 5);
        assert_eq!(code[0].memory_base(), Register::RCX);
        assert_eq!(code[0].memory_index(), Register::RDX);
        assert_eq!(code[0].memory_displacement64(), 0x10);
        assert_eq!(code[1].mnemonic(), Mnemonic::Imul);
        assert_eq!(code[2].immediate8(), 0x3E);
        assert_eq!(code[3].op0_register(), Register::R14D);
        assert_eq!(code[4].mnemonic(), Mnemonic::Lea);
        assert_eq!(code[4].memory_displacement64() as i64, -0x38);
    }
}
