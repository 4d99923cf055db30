//! Detours executed in the test process itself.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::sync::atomic::{AtomicUsize, Ordering};

use sheath_core::hooks::{HookInstaller, PatchKind, PatchSite, ResumeOffsets};
use sheath_core::stub::{StubGenerator, StubProgram};
use sheath_core::{OriginalEntry, PatchableMemory, ProcessMemory, SiteId};

/// mov rax, rdi; add rax, rsi; ret
const ADD: &[u8] = &[0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3];
const ADD_PROLOGUE: &[&[u8]] = &[&[0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0]];

type AddFn = unsafe extern "C" fn(u64, u64) -> u64;

static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

extern "C" fn doubled(a: u64, b: u64) -> u64 {
    let original: AddFn = unsafe { std::mem::transmute(ORIGINAL.load(Ordering::SeqCst)) };
    unsafe { original(a, b) * 2 }
}

#[test]
fn test_detour_runs_handler_and_original() {
    let memory = unsafe { ProcessMemory::new() };

    let function = memory.alloc_code(doubled as usize, ADD.len()).unwrap();
    memory.write_with_permission_change(function, ADD).unwrap();

    let add: AddFn = unsafe { std::mem::transmute(function) };
    assert_eq!(unsafe { add(2, 3) }, 5);

    let mut site = PatchSite::new(
        SiteId::CreateWeaponNodes,
        function,
        PatchKind::FunctionEntry,
        ADD_PROLOGUE,
        ResumeOffsets::new(ADD_PROLOGUE[0].len()),
    );
    assert!(site.validate(&memory));

    let mut program = StubProgram::new();
    program.jump_handler();
    let descriptor = StubGenerator::new(&memory)
        .build(&site, &program, Some(doubled as usize), 0)
        .unwrap();

    let original = HookInstaller::new(&memory)
        .install(&mut site, &descriptor)
        .unwrap();
    assert!(matches!(original, OriginalEntry::Relocated(_)));
    ORIGINAL.store(original.address(), Ordering::SeqCst);

    // The trampoline alone still adds
    let trampoline: AddFn = unsafe { std::mem::transmute(original.address()) };
    assert_eq!(unsafe { trampoline(20, 22) }, 42);

    // The patched entry goes through the handler
    assert_eq!(unsafe { add(2, 3) }, 10);
    assert_eq!(unsafe { add(100, 1) }, 202);
}
