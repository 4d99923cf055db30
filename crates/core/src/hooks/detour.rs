//! Detour installation
//!
//! Writes an unconditional branch from a validated site to its stub and
//! builds the [`OriginalEntry`] from the bytes the branch replaced.

use crate::memory::PatchableMemory;
use crate::stub::{HookDescriptor, StubGenerator};

use super::{HookError, OriginalEntry, PatchKind, PatchSite, WriteFailureCause, CALL_REL32_LEN};

const OP_CALL_REL32: u8 = 0xE8;
const OP_JMP_REL32: u8 = 0xE9;
const NOP: u8 = 0x90;

/// Bytes of each branch form
const JMP_REL32_LEN: usize = 5;
const JMP_INDIRECT_LEN: usize = 6;
const JMP_ABSOLUTE_LEN: usize = 14;

/// A branch the installer can write at a site, shortest form first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// `jmp rel32`
    Rel32(i32),
    /// `jmp qword [rip+disp32]` through an 8-byte slot near the site
    Indirect(i32),
    /// `jmp qword [rip+0]` followed by the target itself
    Absolute(usize),
}

impl Branch {
    pub fn len(self) -> usize {
        match self {
            Branch::Rel32(_) => JMP_REL32_LEN,
            Branch::Indirect(_) => JMP_INDIRECT_LEN,
            Branch::Absolute(_) => JMP_ABSOLUTE_LEN,
        }
    }

    /// Encode the branch, padded with `nop` to `room` bytes.
    pub fn encode(self, room: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(room.max(self.len()));
        match self {
            Branch::Rel32(rel) => {
                bytes.push(OP_JMP_REL32);
                bytes.extend_from_slice(&rel.to_le_bytes());
            }
            Branch::Indirect(disp) => {
                bytes.extend_from_slice(&[0xFF, 0x25]);
                bytes.extend_from_slice(&disp.to_le_bytes());
            }
            Branch::Absolute(target) => {
                bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
                bytes.extend_from_slice(&(target as u64).to_le_bytes());
            }
        }
        bytes.resize(room.max(bytes.len()), NOP);
        bytes
    }
}

/// Displacement from the end of an instruction to `target`, if it fits rel32
fn rel32(instruction_end: usize, target: usize) -> Option<i32> {
    i32::try_from((target as i64).wrapping_sub(instruction_end as i64)).ok()
}

/// Destination of the `call rel32` in `bytes`, which were read from `address`.
pub fn decode_call(address: usize, bytes: &[u8]) -> Option<usize> {
    match bytes {
        [OP_CALL_REL32, b0, b1, b2, b3, ..] => {
            let rel = i32::from_le_bytes([*b0, *b1, *b2, *b3]);
            Some((address + CALL_REL32_LEN).wrapping_add_signed(rel as isize))
        }
        _ => None,
    }
}

/// Read the `call rel32` at `address` and return its destination.
pub fn resolve_call_target<M: PatchableMemory + ?Sized>(memory: &M, address: usize) -> Option<usize> {
    let bytes = memory.read(address, CALL_REL32_LEN).ok()?;
    decode_call(address, &bytes)
}

/// Installs branches from validated sites into their stubs.
pub struct HookInstaller<'m, M: PatchableMemory + ?Sized> {
    memory: &'m M,
}

impl<'m, M: PatchableMemory + ?Sized> HookInstaller<'m, M> {
    pub fn new(memory: &'m M) -> Self {
        Self { memory }
    }

    /// Redirect `site` to `stub.entry`.
    ///
    /// The replaced bytes are captured before anything is written and
    /// turned into the returned [`OriginalEntry`]. The branch and its `nop`
    /// padding go out as a single write; the site is only marked installed
    /// once that write succeeded.
    pub fn install(&self, site: &mut PatchSite, stub: &HookDescriptor) -> Result<OriginalEntry, HookError> {
        let id = site.id();
        if site.is_installed() {
            return Err(HookError::AlreadyInstalled { site: id });
        }
        let len = site.patch_len().ok_or(HookError::NotValidated { site: id })?;

        let replaced = self
            .memory
            .read(site.address(), len)
            .map_err(|e| HookError::write(id, e))?;

        let original = match site.kind() {
            PatchKind::FunctionEntry | PatchKind::MidFunction => {
                let trampoline = StubGenerator::new(self.memory)
                    .relocate(site.address(), &replaced)
                    .map_err(|source| HookError::Stub { site: id, source })?;
                OriginalEntry::Relocated(trampoline)
            }
            PatchKind::CallTarget => {
                let callee = decode_call(site.address(), &replaced).ok_or_else(|| {
                    HookError::DependencyMissing {
                        site: id,
                        what: format!("no call rel32 at {:x}", site.address()),
                    }
                })?;
                OriginalEntry::Callee(callee)
            }
            PatchKind::Guard => return Err(HookError::NotPatchable { site: id }),
        };

        let branch = self
            .select_branch(site.address(), stub.entry, len)
            .map_err(|cause| HookError::write(id, cause))?;
        let patch = branch.encode(len);

        tracing::debug!(
            "Patching {} at {:x}: {:?}, original entry {:x}",
            id,
            site.address(),
            branch,
            original.address()
        );

        self.memory
            .write_with_permission_change(site.address(), &patch)
            .map_err(|e| HookError::write(id, e))?;
        site.mark_installed();

        tracing::info!(
            "Installed hook '{}' at {:x} -> {:x} ({} bytes)",
            id,
            site.address(),
            stub.entry,
            len
        );

        Ok(original)
    }

    /// Pick the shortest branch form that reaches `target` within `room`.
    pub fn select_branch(&self, site: usize, target: usize, room: usize) -> Result<Branch, WriteFailureCause> {
        if room >= JMP_REL32_LEN {
            if let Some(rel) = rel32(site + JMP_REL32_LEN, target) {
                return Ok(Branch::Rel32(rel));
            }
        }

        if room >= JMP_INDIRECT_LEN {
            let slot = self.memory.alloc_code(site, std::mem::size_of::<u64>());
            if let Some((slot, disp)) = slot
                .ok()
                .and_then(|slot| rel32(site + JMP_INDIRECT_LEN, slot).map(|disp| (slot, disp)))
            {
                self.memory.write_word(slot, target)?;
                return Ok(Branch::Indirect(disp));
            }
        }

        if room >= JMP_ABSOLUTE_LEN {
            return Ok(Branch::Absolute(target));
        }

        Err(WriteFailureCause::BranchDoesNotFit {
            needed: if room < JMP_REL32_LEN {
                JMP_REL32_LEN
            } else {
                JMP_ABSOLUTE_LEN
            },
            available: room,
        })
    }
}
