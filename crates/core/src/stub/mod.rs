//! Stub generation
//!
//! Turns a site plus a [`StubProgram`] into executable code placed near the
//! site, and produces the [`HookDescriptor`] the installer branches to.

pub mod ir;
pub mod lower;

use iced_x86::IcedError;

use crate::hooks::PatchSite;
use crate::memory::{MemoryError, PatchableMemory};

pub use ir::{Cond, Gpr, Label, Mem, Op, Resume, StubProgram, Width};
pub use lower::{lower, LowerEnv};

/// Extra bytes reserved on top of the size measured at the site address,
/// covering branches that need a longer form at the final placement
const SIZE_SLACK: usize = 32;

/// Error type for stub generation
#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("displaced bytes end inside an instruction ({decoded} of {len} bytes decoded)")]
    SplitInstruction { decoded: usize, len: usize },

    #[error("undecodable instruction at {address:#x}")]
    Undecodable { address: usize },

    #[error("displaced branch at {address:#x} targets the displaced region")]
    InternalBranch { address: usize },

    #[error("program replays displaced bytes but none were supplied")]
    NothingDisplaced,

    #[error("program calls a handler but none was supplied")]
    MissingHandler,

    #[error("program exits to {0:?} but the site defines no such resume point")]
    MissingResume(Resume),

    #[error("resume offset {offset:#x} lies inside the {len}-byte patched region")]
    ResumeInsidePatch { offset: usize, len: usize },

    #[error("label {0} does not belong to this program")]
    UnknownLabel(usize),

    #[error("site has not been validated")]
    NotValidated,

    #[error("stub grew from {reserved} to {actual} bytes at its final address")]
    SizeChanged { reserved: usize, actual: usize },

    #[error("encoding failed: {0}")]
    Encode(#[from] IcedError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Where a generated stub lives and where it may hand control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookDescriptor {
    /// Stub entry, the target of the site branch
    pub entry: usize,
    /// Resume address of the path that continues the host's logic
    pub continue_at: usize,
    /// Resume address of the diverted path, when the site has one
    pub alternate_at: Option<usize>,
}

/// Places generated code into memory obtained from a [`PatchableMemory`].
pub struct StubGenerator<'m, M: PatchableMemory + ?Sized> {
    memory: &'m M,
}

impl<'m, M: PatchableMemory + ?Sized> StubGenerator<'m, M> {
    pub fn new(memory: &'m M) -> Self {
        Self { memory }
    }

    /// Build the stub for a validated site.
    ///
    /// `context` is embedded into the code for [`Op::LoadContext`].
    pub fn build(
        &self,
        site: &PatchSite,
        program: &StubProgram,
        handler: Option<usize>,
        context: usize,
    ) -> Result<HookDescriptor, StubError> {
        let len = site.patch_len().ok_or(StubError::NotValidated)?;
        let resume = site.resume();
        for offset in std::iter::once(resume.continue_at).chain(resume.alternate_at) {
            if offset < len {
                return Err(StubError::ResumeInsidePatch { offset, len });
            }
        }

        let continue_at = site.address() + resume.continue_at;
        let alternate_at = resume.alternate_at.map(|offset| site.address() + offset);

        let displaced = if program.uses_displaced() {
            self.memory.read(site.address(), len)?
        } else {
            Vec::new()
        };

        let env = LowerEnv {
            origin: site.address(),
            displaced: &displaced,
            displaced_at: site.address(),
            handler,
            context,
            continue_at: Some(continue_at),
            alternate_at,
        };
        let entry = self.emit(site.address(), program, env)?;

        tracing::debug!(
            "Built stub for {} at {:x} (continue {:x}, alternate {:?})",
            site.id(),
            entry,
            continue_at,
            alternate_at
        );

        Ok(HookDescriptor {
            entry,
            continue_at,
            alternate_at,
        })
    }

    /// Place a relocated copy of `displaced`, read from `address`, followed
    /// by a jump to the first byte after it. Returns the copy's address.
    pub fn relocate(&self, address: usize, displaced: &[u8]) -> Result<usize, StubError> {
        let env = LowerEnv {
            origin: address,
            displaced,
            displaced_at: address,
            handler: None,
            context: 0,
            continue_at: Some(address + displaced.len()),
            alternate_at: None,
        };
        self.emit(address, &StubProgram::relocation(), env)
    }

    /// Place code that belongs to no site, such as a virtual-dispatch thunk.
    pub fn build_detached(
        &self,
        near: usize,
        program: &StubProgram,
        handler: Option<usize>,
        context: usize,
    ) -> Result<usize, StubError> {
        let env = LowerEnv {
            origin: near,
            displaced: &[],
            displaced_at: near,
            handler,
            context,
            continue_at: None,
            alternate_at: None,
        };
        self.emit(near, program, env)
    }

    fn emit(&self, near: usize, program: &StubProgram, mut env: LowerEnv<'_>) -> Result<usize, StubError> {
        // Measure at the site address first; the final placement is only
        // known once the size is
        env.origin = near;
        let reserved = lower(program, &env)?.len() + SIZE_SLACK;

        let origin = self.memory.alloc_code(near, reserved)?;
        env.origin = origin;
        let code = lower(program, &env)?;
        if code.len() > reserved {
            return Err(StubError::SizeChanged {
                reserved,
                actual: code.len(),
            });
        }

        self.memory.write_with_permission_change(origin, &code)?;
        Ok(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{PatchKind, ResumeOffsets};
    use crate::memory::SimulatedMemory;
    use crate::sites::SiteId;

    const SITE: usize = 0x1_4000_1000;
    const ARENA: usize = 0x1_4100_0000;
    const SCB_ATTACH: &[u8] = &[0x80, 0x7D, 0x6F, 0x00, 0x75, 0x1E];

    fn setup() -> (SimulatedMemory, PatchSite) {
        let memory = SimulatedMemory::new();
        memory.map(SITE, &[SCB_ATTACH, &[0x90u8; 0x40][..]].concat());
        memory.map_code_arena(ARENA, 0x1000);
        let site = PatchSite::new(
            SiteId::ScabbardAttach,
            SITE,
            PatchKind::MidFunction,
            &[SCB_ATTACH],
            ResumeOffsets::with_alternate(6, 0x24),
        );
        (memory, site)
    }

    #[test]
    fn test_build_requires_validation() {
        let (memory, site) = setup();
        let generator = StubGenerator::new(&memory);
        let err = generator
            .build(&site, &StubProgram::relocation(), None, 0)
            .unwrap_err();
        assert!(matches!(err, StubError::NotValidated));
    }

    #[test]
    fn test_descriptor_resume_addresses() {
        let (memory, mut site) = setup();
        assert!(site.validate(&memory));

        let mut program = StubProgram::new();
        let skip = program.label();
        program
            .call_handler()
            .test(Gpr::Rax, Width::Qword)
            .branch(Cond::Equal, skip)
            .exit(Resume::Continue)
            .bind(skip)
            .exit(Resume::Alternate);

        let descriptor = StubGenerator::new(&memory)
            .build(&site, &program, Some(0x1_4200_0000), 0)
            .unwrap();
        assert_eq!(descriptor.continue_at, SITE + 6);
        assert_eq!(descriptor.alternate_at, Some(SITE + 0x24));
        assert_eq!(descriptor.entry, ARENA);
        // The stub was written into the arena, the site is untouched
        assert_ne!(memory.read(ARENA, 1).unwrap(), vec![0xCC]);
        assert_eq!(memory.host_write_count(), 0);
    }

    #[test]
    fn test_resume_inside_patch_rejected() {
        let (memory, _) = setup();
        let mut site = PatchSite::new(
            SiteId::ScabbardAttach,
            SITE,
            PatchKind::MidFunction,
            &[SCB_ATTACH],
            ResumeOffsets::new(4),
        );
        assert!(site.validate(&memory));
        let err = StubGenerator::new(&memory)
            .build(&site, &StubProgram::relocation(), None, 0)
            .unwrap_err();
        assert!(matches!(err, StubError::ResumeInsidePatch { offset: 4, len: 6 }));
    }

    #[test]
    fn test_arena_exhausted() {
        let memory = SimulatedMemory::new();
        memory.map(SITE, SCB_ATTACH);
        let err = StubGenerator::new(&memory)
            .relocate(SITE, SCB_ATTACH)
            .unwrap_err();
        assert!(matches!(err, StubError::Memory(MemoryError::Exhausted { .. })));
    }
}
