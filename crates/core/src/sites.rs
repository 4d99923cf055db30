//! Site catalog
//!
//! Every host location the engine knows how to patch: its kind, the byte
//! signatures it was written against, where execution resumes, and the stub
//! program that runs there. Addresses are not part of the catalog; they come
//! from the host layout.

use std::fmt;
use std::str::FromStr;

use sheath_sdk::offsets::{
    form_type, BIPED_OBJECT_ITEM_OFFSET, BIPED_OBJECT_STRIDE, NPC_RACE_OFFSET,
    RACE_SHIELD_SLOT_OFFSET, REFR_BASE_FORM_OFFSET,
};
use sheath_sdk::FORM_TYPE_OFFSET;

use crate::hooks::{PatchKind, PatchSite, ResumeOffsets};
use crate::stub::{Cond, Gpr, Mem, Resume, StubProgram, Width};
use crate::validation::MemoryValidationFlags;

/// Slot of `TESObjectWEAP`'s `BGSEquipType::SetEquipSlot` override
pub const SET_EQUIP_SLOT_INDEX: usize = 0x86 + 0x5;

/// Stable identifier of a patch site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SiteId {
    CreateWeaponNodes,
    ScabbardAttach,
    ScabbardDetach,
    CreateArmorNode,
    ShieldAttach,
    DisableShieldHideOnSit,
    ShieldHandGraphVariable,
    ShieldHandHolderVariable,
    ShieldHandLeftHandSync,
    WeaponSetEquipSlot,
}

impl SiteId {
    pub const ALL: [SiteId; 10] = [
        SiteId::CreateWeaponNodes,
        SiteId::ScabbardAttach,
        SiteId::ScabbardDetach,
        SiteId::CreateArmorNode,
        SiteId::ShieldAttach,
        SiteId::DisableShieldHideOnSit,
        SiteId::ShieldHandGraphVariable,
        SiteId::ShieldHandHolderVariable,
        SiteId::ShieldHandLeftHandSync,
        SiteId::WeaponSetEquipSlot,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            SiteId::CreateWeaponNodes => "CreateWeaponNodes",
            SiteId::ScabbardAttach => "ScabbardAttach",
            SiteId::ScabbardDetach => "ScabbardDetach",
            SiteId::CreateArmorNode => "CreateArmorNode",
            SiteId::ShieldAttach => "ShieldAttach",
            SiteId::DisableShieldHideOnSit => "DisableShieldHideOnSit",
            SiteId::ShieldHandGraphVariable => "ShieldHandGraphVariable",
            SiteId::ShieldHandHolderVariable => "ShieldHandHolderVariable",
            SiteId::ShieldHandLeftHandSync => "ShieldHandLeftHandSync",
            SiteId::WeaponSetEquipSlot => "WeaponSetEquipSlot",
        }
    }

    /// Flag raised for this site when its signature check fails.
    ///
    /// Virtual dispatch slots carry no signature and map to no flag.
    pub const fn validation_flag(self) -> MemoryValidationFlags {
        match self {
            SiteId::CreateWeaponNodes => MemoryValidationFlags::CREATE_WEAPON_NODES,
            SiteId::ScabbardAttach => MemoryValidationFlags::SCABBARD_ATTACH,
            SiteId::ScabbardDetach => MemoryValidationFlags::SCABBARD_DETACH,
            SiteId::CreateArmorNode => MemoryValidationFlags::CREATE_ARMOR_NODE,
            SiteId::ShieldAttach => MemoryValidationFlags::SHIELD_ATTACH,
            SiteId::DisableShieldHideOnSit => MemoryValidationFlags::DISABLE_SHIELD_HIDE_ON_SIT,
            SiteId::ShieldHandGraphVariable => MemoryValidationFlags::SHIELD_HAND_GRAPH_VARIABLE,
            SiteId::ShieldHandHolderVariable => MemoryValidationFlags::SHIELD_HAND_HOLDER_VARIABLE,
            SiteId::ShieldHandLeftHandSync => MemoryValidationFlags::SHIELD_HAND_LEFT_HAND_SYNC,
            SiteId::WeaponSetEquipSlot => MemoryValidationFlags::empty(),
        }
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown site '{0}'")]
pub struct UnknownSite(pub String);

impl FromStr for SiteId {
    type Err = UnknownSite;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SiteId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| UnknownSite(s.to_string()))
    }
}

/// Static description of a byte-patched site
#[derive(Debug)]
pub struct SiteSpec {
    pub id: SiteId,
    pub kind: PatchKind,
    pub signatures: &'static [&'static [u8]],
    pub resume: ResumeOffsets,
}

impl SiteSpec {
    /// A fresh, unvalidated site at `address`
    pub fn at(&self, address: usize) -> PatchSite {
        PatchSite::new(self.id, address, self.kind, self.signatures, self.resume)
    }
}

/// `call rel32`; only the opcode is fixed, the displacement is build specific
const CALL_SIGNATURE: &[&[u8]] = &[&[0xE8]];

static CATALOG: [SiteSpec; 9] = [
    SiteSpec {
        id: SiteId::CreateWeaponNodes,
        kind: PatchKind::FunctionEntry,
        // push rsi; push rdi; push r12; push r14
        signatures: &[&[0x40, 0x56, 0x57, 0x41, 0x54, 0x41, 0x56]],
        resume: ResumeOffsets::new(7),
    },
    SiteSpec {
        id: SiteId::ScabbardAttach,
        kind: PatchKind::MidFunction,
        // cmp byte [rbp+0x6F], 0; jne +0x1E
        signatures: &[&[0x80, 0x7D, 0x6F, 0x00, 0x75, 0x1E]],
        resume: ResumeOffsets::with_alternate(0x6, 0x24),
    },
    SiteSpec {
        id: SiteId::ScabbardDetach,
        kind: PatchKind::MidFunction,
        // je +0xB3
        signatures: &[&[0x0F, 0x84, 0xB3, 0x00, 0x00, 0x00]],
        resume: ResumeOffsets::with_alternate(0x6, 0xB9),
    },
    SiteSpec {
        id: SiteId::CreateArmorNode,
        kind: PatchKind::Guard,
        // test rax, rax; je +0xD, or a branch another plugin placed there
        signatures: &[&[0x48, 0x85, 0xC0, 0x74, 0x0D], &[0xE9]],
        resume: ResumeOffsets::new(0),
    },
    SiteSpec {
        id: SiteId::ShieldAttach,
        kind: PatchKind::MidFunction,
        // mov rax, [rsi]; mov r8b, 1
        signatures: &[&[0x48, 0x8B, 0x06, 0x41, 0xB0, 0x01]],
        resume: ResumeOffsets::with_alternate(0x6, 0x12),
    },
    SiteSpec {
        id: SiteId::DisableShieldHideOnSit,
        kind: PatchKind::MidFunction,
        // mov r9, [rdx]; mov rax, [rcx+0x1F0]
        signatures: &[&[0x4C, 0x8B, 0x0A, 0x48, 0x8B, 0x81, 0xF0, 0x01, 0x00, 0x00]],
        resume: ResumeOffsets::with_alternate(0xA, 0x53),
    },
    SiteSpec {
        id: SiteId::ShieldHandGraphVariable,
        kind: PatchKind::CallTarget,
        signatures: CALL_SIGNATURE,
        resume: ResumeOffsets::new(0x5),
    },
    SiteSpec {
        id: SiteId::ShieldHandHolderVariable,
        kind: PatchKind::CallTarget,
        signatures: CALL_SIGNATURE,
        resume: ResumeOffsets::new(0x5),
    },
    SiteSpec {
        id: SiteId::ShieldHandLeftHandSync,
        kind: PatchKind::CallTarget,
        signatures: CALL_SIGNATURE,
        resume: ResumeOffsets::new(0x5),
    },
];

/// Catalog entry of a byte-patched site; `None` for virtual dispatch slots.
pub fn site_spec(id: SiteId) -> Option<&'static SiteSpec> {
    CATALOG.iter().find(|spec| spec.id == id)
}

/// The stub that runs when the host reaches `id`; `None` for guard sites.
///
/// Every program hands the engine context to its handler in a register or
/// stack argument the handler's signature reserves for it.
pub fn stub_program(id: SiteId) -> Option<StubProgram> {
    Some(match id {
        SiteId::CreateWeaponNodes => create_weapon_nodes(),
        SiteId::ScabbardAttach => scabbard_attach(),
        SiteId::ScabbardDetach => scabbard_detach(),
        SiteId::CreateArmorNode => return None,
        SiteId::ShieldAttach => shield_attach(),
        SiteId::DisableShieldHideOnSit => disable_shield_hide_on_sit(),
        SiteId::ShieldHandGraphVariable => shield_hand(ActorSource::Lea(Gpr::Rbp.at(-0x38))),
        SiteId::ShieldHandHolderVariable => shield_hand(ActorSource::Move(Gpr::Rsi)),
        SiteId::ShieldHandLeftHandSync => shield_hand(ActorSource::Lea(Gpr::R15.at(-0xB8))),
        SiteId::WeaponSetEquipSlot => set_equip_slot_thunk(),
    })
}

/// Function entry: the three arguments stay where the host put them, the
/// context goes into `r9`, and the handler returns straight to the caller.
fn create_weapon_nodes() -> StubProgram {
    let mut p = StubProgram::new();
    p.load_context(Gpr::R9).jump_handler();
    p
}

/// Loads `biped[r14].item` into `dst` through the frame's biped array.
/// Uses `scratch` as a temporary.
fn load_biped_item(p: &mut StubProgram, dst: Gpr, scratch: Gpr) {
    p.load(scratch, Gpr::Rbp.at(0x77))
        .load(scratch, scratch.at(0))
        .imul(dst, Gpr::R14, BIPED_OBJECT_STRIDE)
        .load(dst, Mem::indexed(scratch, dst, BIPED_OBJECT_ITEM_OFFSET));
}

/// Asks for a scabbard attachment node when the host is about to skip
/// attaching one. A non-null answer replaces `rsi` (the attachment node)
/// and the host continues into its attach code; null skips it.
///
/// Clobbers `rcx`, `rdx`, `r8`, `r9` (host scratch at this point).
fn scabbard_attach() -> StubProgram {
    let mut p = StubProgram::new();
    let cont = p.label();
    let skip = p.label();

    p.cmp_byte(Gpr::Rbp.at(0x6F), 0).branch(Cond::Equal, cont);
    load_biped_item(&mut p, Gpr::Rdx, Gpr::Rcx);
    p.load(Gpr::Rcx, Gpr::Rbp.at(-0x31))
        .mov(Gpr::R8, Gpr::Rsi)
        .load_context(Gpr::R9)
        .push(Gpr::Rax)
        .alloc_stack(0x20)
        .call_handler()
        .mov(Gpr::Rdx, Gpr::Rax)
        .free_stack(0x20)
        .pop(Gpr::Rax)
        .test(Gpr::Rdx, Width::Qword)
        .branch(Cond::Equal, skip)
        .mov(Gpr::Rsi, Gpr::Rdx)
        .bind(cont)
        .exit(Resume::Continue)
        .bind(skip)
        .exit(Resume::Alternate);
    p
}

/// Replaces the host's "not a weapon slot" branch: for non-weapon slots the
/// handler may supply a scabbard node (written to `r12`), otherwise the host
/// takes its shield path.
///
/// Clobbers `rcx`, `rdx`, `r8`, `r9`, `rax`.
fn scabbard_detach() -> StubProgram {
    let mut p = StubProgram::new();
    let found = p.label();
    let weapon_slot = p.label();

    p.branch(Cond::NotEqual, weapon_slot)
        .load(Gpr::Rcx, Gpr::Rbp.at(-0x20))
        .load(Gpr::Rdx, Gpr::Rdi.at(0))
        .mov(Gpr::R8, Gpr::R12)
        .load_context(Gpr::R9)
        .call_handler()
        .test(Gpr::Rax, Width::Qword)
        .branch(Cond::NotEqual, found)
        .exit(Resume::Alternate)
        .bind(found)
        .mov(Gpr::R12, Gpr::Rax)
        .bind(weapon_slot)
        .exit(Resume::Continue);
    p
}

/// Routes shield attachment through the handler when the object being
/// attached is the actor's race shield slot. Anything else replays the
/// displaced instructions and continues as the host would.
///
/// Clobbers `rcx`, `rdx`, `r8`, `r9`, `rax`.
fn shield_attach() -> StubProgram {
    let mut p = StubProgram::new();
    let skip = p.label();

    p.cmp_dword(Gpr::R14, -1)
        .branch(Cond::Equal, skip)
        .load(Gpr::Rcx, Gpr::Rbp.at(-0x31))
        .test(Gpr::Rcx, Width::Qword)
        .branch(Cond::Equal, skip)
        .cmp_byte(Gpr::Rcx.at(FORM_TYPE_OFFSET as i32), form_type::ACTOR)
        .branch(Cond::NotEqual, skip)
        .load(Gpr::Rax, Gpr::Rcx.at(REFR_BASE_FORM_OFFSET))
        .test(Gpr::Rax, Width::Qword)
        .branch(Cond::Equal, skip)
        .cmp_byte(Gpr::Rax.at(FORM_TYPE_OFFSET as i32), form_type::NPC)
        .branch(Cond::NotEqual, skip)
        .load(Gpr::R8, Gpr::Rax.at(NPC_RACE_OFFSET))
        .test(Gpr::R8, Width::Qword)
        .branch(Cond::Equal, skip)
        .cmp_dword_mem(Gpr::R14, Gpr::R8.at(RACE_SHIELD_SLOT_OFFSET))
        .branch(Cond::NotEqual, skip);
    load_biped_item(&mut p, Gpr::Rdx, Gpr::R8);
    p.mov(Gpr::R8, Gpr::Rsi)
        .mov(Gpr::R9, Gpr::Rdi)
        .call_handler_with_stack_context()
        .exit(Resume::Alternate)
        .bind(skip)
        .displaced()
        .exit(Resume::Continue);
    p
}

/// While sitting, asks whether hiding the shield should be skipped. The
/// actor is already in `rcx`; the context goes into `rdx`, which is saved.
fn disable_shield_hide_on_sit() -> StubProgram {
    let mut p = StubProgram::new();
    let cont = p.label();
    let skip = p.label();

    p.test(Gpr::R8, Width::Byte)
        .branch(Cond::Equal, cont)
        .push(Gpr::Rcx)
        .push(Gpr::Rdx)
        .push(Gpr::R8)
        .alloc_stack(0x20)
        .load_context(Gpr::Rdx)
        .call_handler()
        .free_stack(0x20)
        .pop(Gpr::R8)
        .pop(Gpr::Rdx)
        .pop(Gpr::Rcx)
        .test(Gpr::Rax, Width::Byte)
        .branch(Cond::NotEqual, skip)
        .bind(cont)
        .displaced()
        .exit(Resume::Continue)
        .bind(skip)
        .exit(Resume::Alternate);
    p
}

/// Where a shield-hand call site keeps the actor
enum ActorSource {
    Lea(Mem),
    Move(Gpr),
}

/// Replaces a `call` of a hand-type setter: the original three arguments
/// stay in place, the actor goes into `r9` and the context onto the stack.
fn shield_hand(actor: ActorSource) -> StubProgram {
    let mut p = StubProgram::new();
    match actor {
        ActorSource::Lea(mem) => p.lea(Gpr::R9, mem),
        ActorSource::Move(reg) => p.mov(Gpr::R9, reg),
    };
    p.call_handler_with_stack_context().exit(Resume::Continue);
    p
}

/// Thunk placed in a virtual dispatch slot: passes the context as the third
/// argument and tail-calls the handler.
fn set_equip_slot_thunk() -> StubProgram {
    let mut p = StubProgram::new();
    p.load_context(Gpr::R8).jump_handler();
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::Op;

    #[test]
    fn test_names_roundtrip() {
        for id in SiteId::ALL {
            assert_eq!(id.name().parse::<SiteId>(), Ok(id));
        }
        assert_eq!(
            "Nope".parse::<SiteId>(),
            Err(UnknownSite("Nope".to_string()))
        );
    }

    #[test]
    fn test_every_byte_site_has_a_spec() {
        for id in SiteId::ALL {
            let spec = site_spec(id);
            assert_eq!(spec.is_some(), id != SiteId::WeaponSetEquipSlot, "{}", id);
            if let Some(spec) = spec {
                assert_eq!(spec.id, id);
                assert!(!id.validation_flag().is_empty());
            }
        }
    }

    #[test]
    fn test_resume_offsets_clear_patched_bytes() {
        for spec in CATALOG.iter().filter(|spec| spec.kind != PatchKind::Guard) {
            let len = match spec.kind {
                PatchKind::CallTarget => crate::hooks::CALL_REL32_LEN,
                _ => spec.signatures.iter().map(|s| s.len()).min().unwrap(),
            };
            assert!(spec.resume.continue_at >= len, "{}", spec.id);
            if let Some(alternate) = spec.resume.alternate_at {
                assert!(alternate >= len, "{}", spec.id);
            }
        }
    }

    #[test]
    fn test_programs_only_exit_where_sites_resume() {
        for spec in &CATALOG {
            let Some(program) = stub_program(spec.id) else {
                assert_eq!(spec.kind, PatchKind::Guard, "{}", spec.id);
                continue;
            };
            assert!(program.uses_handler(), "{}", spec.id);
            if program.uses_resume(Resume::Alternate) {
                assert!(spec.resume.alternate_at.is_some(), "{}", spec.id);
            }
        }
    }

    #[test]
    fn test_armor_node_accepts_foreign_branch() {
        let memory = crate::memory::SimulatedMemory::new();
        memory
            .map(0x1000, &[0x48, 0x85, 0xC0, 0x74, 0x0D])
            .map(0x2000, &[0xE9, 0x10, 0x20, 0x30, 0x40])
            .map(0x3000, &[0x48, 0x85, 0xC0, 0x75, 0x0D]);
        let spec = site_spec(SiteId::CreateArmorNode).unwrap();

        let mut intact = spec.at(0x1000);
        assert!(intact.validate(&memory));
        assert_eq!(intact.matched_signature().map(|s| s.len()), Some(5));

        let mut hooked = spec.at(0x2000);
        assert!(hooked.validate(&memory));
        assert_eq!(hooked.matched_signature(), Some(&[0xE9][..]));

        assert!(!spec.at(0x3000).validate(&memory));
    }

    #[test]
    fn test_shield_hand_actor_registers() {
        let program = stub_program(SiteId::ShieldHandHolderVariable).unwrap();
        assert_eq!(
            program.ops()[0],
            Op::Move {
                dst: Gpr::R9,
                src: Gpr::Rsi
            }
        );
        assert_eq!(program.ops().last(), Some(&Op::Exit(Resume::Continue)));
    }
}
