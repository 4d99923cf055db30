//! Live process memory
//!
//! Reads and writes the current process directly, using `region` for
//! protection changes and a page allocator that places engine code within
//! ±2GB of the sites that jump into it.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{within_range, MemoryError, PatchableMemory, MAX_RANGE};

/// Page size (4KB on most systems)
const PAGE_SIZE: usize = 4096;

/// Address granularity used when probing for pages near a target
const PROBE_STEP: usize = PAGE_SIZE * 64;

/// Allocations are aligned so stubs start on a fresh fetch block
const CODE_ALIGN: usize = 16;

/// The current process's address space.
pub struct ProcessMemory {
    allocator: Mutex<CodeAllocator>,
}

impl ProcessMemory {
    /// Create a handle to the current process's memory.
    ///
    /// # Safety
    ///
    /// Writes go straight into the running process. The caller must only
    /// hand addresses to the engine that it is prepared to have patched,
    /// and must not run code at a site while it is being written.
    pub unsafe fn new() -> Self {
        Self {
            allocator: Mutex::new(CodeAllocator::new()),
        }
    }

    fn ensure_readable(address: usize, len: usize) -> Result<(), MemoryError> {
        let unmapped = MemoryError::Unmapped { address, len };
        let end = address.checked_add(len).ok_or(unmapped.clone())?;

        let regions = region::query_range(address as *const u8, len).map_err(|_| unmapped.clone())?;
        let mut cursor = address;
        for region in regions {
            let region = region.map_err(|_| unmapped.clone())?;
            let range = region.as_range();
            if range.start > cursor || !region.is_readable() {
                return Err(unmapped);
            }
            cursor = range.end;
            if cursor >= end {
                return Ok(());
            }
        }

        Err(unmapped)
    }
}

impl PatchableMemory for ProcessMemory {
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        Self::ensure_readable(address, len)?;

        let mut bytes = vec![0u8; len];
        // SAFETY: every byte of the window was just checked to be mapped and readable
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, bytes.as_mut_ptr(), len);
        }
        Ok(bytes)
    }

    fn write_with_permission_change(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let target = address as *const u8;

        // Keep whatever the page already allows (execute for code, read for
        // tables) and add write on top of it.
        let current = region::query(target)
            .map_err(|_| MemoryError::Unmapped {
                address,
                len: bytes.len(),
            })?
            .protection();

        // SAFETY: the range is mapped (query succeeded); the guard restores
        // the previous protection when dropped
        unsafe {
            let _guard = region::protect_with_handle(
                target,
                bytes.len(),
                current | region::Protection::READ_WRITE,
            )
            .map_err(|e| MemoryError::Protection {
                address,
                reason: e.to_string(),
            })?;

            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }

        Ok(())
    }

    fn alloc_code(&self, near: usize, size: usize) -> Result<usize, MemoryError> {
        self.allocator
            .lock()
            .alloc_near(near, size)
            .ok_or(MemoryError::Exhausted { near, size })
    }
}

/// Allocator for executable stub memory
struct CodeAllocator {
    /// Pages allocated, keyed by base address
    pages: BTreeMap<usize, PageInfo>,
}

struct PageInfo {
    size: usize,
    used: usize,
}

impl CodeAllocator {
    const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Allocate executable memory near the target address
    fn alloc_near(&mut self, target: usize, size: usize) -> Option<usize> {
        if size == 0 || size > PAGE_SIZE {
            return None;
        }

        // First, try to find an existing page within range
        for (&base, page) in &mut self.pages {
            let start = page.used.next_multiple_of(CODE_ALIGN);
            if within_range(base, target) && start + size <= page.size {
                page.used = start + size;
                return Some(base + start);
            }
        }

        // Allocate a new page near the target
        let base = self.alloc_page_near(target)?;
        let page = self.pages.get_mut(&base)?;
        page.used = size;
        Some(base)
    }

    fn alloc_page_near(&mut self, target: usize) -> Option<usize> {
        let search_start = target.saturating_sub(MAX_RANGE) & !(PROBE_STEP - 1);
        let search_end = target.saturating_add(MAX_RANGE);

        // Try allocating at hint addresses within range
        for hint in (search_start..search_end).step_by(PROBE_STEP) {
            // Skip invalid addresses
            if hint == 0 {
                continue;
            }

            if let Some(base) = map_page(Some(hint)) {
                if within_range(base, target) {
                    self.insert_page(base);
                    return Some(base);
                }
                // Allocation was too far, unmap it
                unmap_page(base);
            }
        }

        // Try without hint as a fallback; branches into it will have to use
        // the absolute form
        if let Some(base) = map_page(None) {
            self.insert_page(base);
            tracing::warn!(
                "Code allocation fallback: allocated at {:x} for target {:x}",
                base,
                target
            );
            return Some(base);
        }

        tracing::error!("Failed to allocate page near {:x}", target);
        None
    }

    fn insert_page(&mut self, base: usize) {
        self.pages.insert(
            base,
            PageInfo {
                size: PAGE_SIZE,
                used: 0,
            },
        );
    }
}

#[cfg(unix)]
fn map_page(hint: Option<usize>) -> Option<usize> {
    use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let length = NonZeroUsize::new(PAGE_SIZE)?;
    let result = unsafe {
        mmap_anonymous(
            hint.and_then(NonZeroUsize::new),
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    };

    result.ok().map(|ptr| ptr.as_ptr() as usize)
}

#[cfg(unix)]
fn unmap_page(base: usize) {
    if let Some(ptr) = std::ptr::NonNull::new(base as *mut std::ffi::c_void) {
        unsafe {
            let _ = nix::sys::mman::munmap(ptr, PAGE_SIZE);
        }
    }
}

#[cfg(not(unix))]
fn map_page(hint: Option<usize>) -> Option<usize> {
    let allocation = match hint {
        Some(hint) => region::alloc_at(
            hint as *const u8,
            PAGE_SIZE,
            region::Protection::READ_WRITE_EXECUTE,
        ),
        None => region::alloc(PAGE_SIZE, region::Protection::READ_WRITE_EXECUTE),
    }
    .ok()?;

    let base = allocation.as_ptr::<u8>() as usize;
    // Pages live for the process lifetime; ownership moves to the page table
    std::mem::forget(allocation);
    Some(base)
}

#[cfg(not(unix))]
fn unmap_page(base: usize) {
    // Pages handed out by `region` are only released by dropping their
    // `Allocation`, which was forgotten; a far page simply stays unused.
    let _ = base;
}
