//! Stub programs
//!
//! A stub is described as a short list of [`Op`]s over named registers,
//! labels and resume points. Programs are built once per site and lowered to
//! machine code by [`super::lower`].

/// 64-bit general purpose registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    /// `[self + disp]`
    pub const fn at(self, disp: i32) -> Mem {
        Mem {
            base: self,
            index: None,
            disp,
        }
    }
}

/// A memory operand `[base + index + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    pub index: Option<Gpr>,
    pub disp: i32,
}

impl Mem {
    pub const fn indexed(base: Gpr, index: Gpr, disp: i32) -> Self {
        Self {
            base,
            index: Some(index),
            disp,
        }
    }
}

/// Operand width for register tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Dword,
    Qword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Equal,
    NotEqual,
}

/// A position inside a program, bound with [`StubProgram::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) usize);

/// Where control goes when the stub leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resume {
    /// The path that continues the host's own logic
    Continue,
    /// The diverted path
    Alternate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Relocated copy of the instructions the site branch overwrites
    Displaced,
    /// `mov dst, qword [src]`
    Load { dst: Gpr, src: Mem },
    /// `mov dst, src`
    Move { dst: Gpr, src: Gpr },
    /// `lea dst, [src]`
    Lea { dst: Gpr, src: Mem },
    /// `imul dst, src, imm`
    Imul { dst: Gpr, src: Gpr, imm: i32 },
    /// `mov dst, imm64` of the engine context address
    LoadContext(Gpr),
    /// `mov qword [rsp + disp], src`
    StoreStack { disp: i32, src: Gpr },
    Push(Gpr),
    Pop(Gpr),
    /// `sub rsp, n`
    AllocStack(i32),
    /// `add rsp, n`
    FreeStack(i32),
    /// `cmp byte [mem], imm`
    CmpByte { mem: Mem, imm: u8 },
    /// `cmp reg32, imm`
    CmpDword { reg: Gpr, imm: i32 },
    /// `cmp reg32, dword [mem]`
    CmpDwordMem { reg: Gpr, mem: Mem },
    /// `test reg, reg` at the given width
    Test { reg: Gpr, width: Width },
    Branch { cond: Cond, to: Label },
    Jump(Label),
    Bind(Label),
    /// `call` the handler
    CallHandler,
    /// `jmp` to the handler, leaving the return address in place
    JumpHandler,
    /// `jmp` to a resume point
    Exit(Resume),
}

/// A stub described as a sequence of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubProgram {
    ops: Vec<Op>,
    labels: usize,
}

impl StubProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program that replays the displaced instructions and continues the
    /// host's logic; the body of every relocated original entry.
    pub fn relocation() -> Self {
        let mut program = Self::new();
        program.displaced().exit(Resume::Continue);
        program
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn label_count(&self) -> usize {
        self.labels
    }

    /// Create a new unbound label
    pub fn label(&mut self) -> Label {
        self.labels += 1;
        Label(self.labels - 1)
    }

    /// Whether any op refers to the given resume point
    pub fn uses_resume(&self, resume: Resume) -> bool {
        self.ops.iter().any(|op| *op == Op::Exit(resume))
    }

    /// Whether the program calls or jumps to a handler
    pub fn uses_handler(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::CallHandler | Op::JumpHandler))
    }

    /// Whether the program replays displaced instructions
    pub fn uses_displaced(&self) -> bool {
        self.ops.contains(&Op::Displaced)
    }

    pub fn push_op(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn displaced(&mut self) -> &mut Self {
        self.push_op(Op::Displaced)
    }

    pub fn load(&mut self, dst: Gpr, src: Mem) -> &mut Self {
        self.push_op(Op::Load { dst, src })
    }

    pub fn mov(&mut self, dst: Gpr, src: Gpr) -> &mut Self {
        self.push_op(Op::Move { dst, src })
    }

    pub fn lea(&mut self, dst: Gpr, src: Mem) -> &mut Self {
        self.push_op(Op::Lea { dst, src })
    }

    pub fn imul(&mut self, dst: Gpr, src: Gpr, imm: i32) -> &mut Self {
        self.push_op(Op::Imul { dst, src, imm })
    }

    pub fn load_context(&mut self, dst: Gpr) -> &mut Self {
        self.push_op(Op::LoadContext(dst))
    }

    pub fn store_stack(&mut self, disp: i32, src: Gpr) -> &mut Self {
        self.push_op(Op::StoreStack { disp, src })
    }

    pub fn push(&mut self, reg: Gpr) -> &mut Self {
        self.push_op(Op::Push(reg))
    }

    pub fn pop(&mut self, reg: Gpr) -> &mut Self {
        self.push_op(Op::Pop(reg))
    }

    pub fn alloc_stack(&mut self, size: i32) -> &mut Self {
        self.push_op(Op::AllocStack(size))
    }

    pub fn free_stack(&mut self, size: i32) -> &mut Self {
        self.push_op(Op::FreeStack(size))
    }

    pub fn cmp_byte(&mut self, mem: Mem, imm: u8) -> &mut Self {
        self.push_op(Op::CmpByte { mem, imm })
    }

    pub fn cmp_dword(&mut self, reg: Gpr, imm: i32) -> &mut Self {
        self.push_op(Op::CmpDword { reg, imm })
    }

    pub fn cmp_dword_mem(&mut self, reg: Gpr, mem: Mem) -> &mut Self {
        self.push_op(Op::CmpDwordMem { reg, mem })
    }

    pub fn test(&mut self, reg: Gpr, width: Width) -> &mut Self {
        self.push_op(Op::Test { reg, width })
    }

    pub fn branch(&mut self, cond: Cond, to: Label) -> &mut Self {
        self.push_op(Op::Branch { cond, to })
    }

    pub fn jump(&mut self, to: Label) -> &mut Self {
        self.push_op(Op::Jump(to))
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.push_op(Op::Bind(label))
    }

    pub fn call_handler(&mut self) -> &mut Self {
        self.push_op(Op::CallHandler)
    }

    pub fn jump_handler(&mut self) -> &mut Self {
        self.push_op(Op::JumpHandler)
    }

    pub fn exit(&mut self, resume: Resume) -> &mut Self {
        self.push_op(Op::Exit(resume))
    }

    /// Call the handler with the engine context as the fifth (first stack)
    /// argument, keeping the four register arguments intact. Clobbers `rax`.
    pub fn call_handler_with_stack_context(&mut self) -> &mut Self {
        self.alloc_stack(0x30)
            .load_context(Gpr::Rax)
            .store_stack(0x20, Gpr::Rax)
            .call_handler()
            .free_stack(0x30)
    }
}
