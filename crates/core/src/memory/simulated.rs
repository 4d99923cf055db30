//! Simulated address space
//!
//! A set of byte-buffer regions at fixed base addresses. Regions can be
//! locked to refuse permission changes, and code arenas serve
//! [`PatchableMemory::alloc_code`]. Tests map host code into one and inspect
//! what the engine wrote.

use parking_lot::RwLock;

use super::{within_range, MemoryError, PatchableMemory};

/// Filler for unused arena bytes (`int3`)
const ARENA_FILL: u8 = 0xCC;

/// Alignment of arena allocations
const ARENA_ALIGN: usize = 16;

#[derive(Debug)]
struct Region {
    base: usize,
    bytes: Vec<u8>,
    /// Permission changes are refused
    locked: bool,
    /// Bump offset when the region is a code arena
    arena: Option<usize>,
}

impl Region {
    fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.bytes.len())
    }
}

#[derive(Debug, Default)]
struct State {
    regions: Vec<Region>,
    /// Writes that landed outside code arenas
    host_writes: usize,
}

impl State {
    fn region(&self, address: usize, len: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(address, len))
    }

    fn region_mut(&mut self, address: usize, len: usize) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.contains(address, len))
    }
}

/// In-memory address space implementing [`PatchableMemory`].
#[derive(Debug, Default)]
pub struct SimulatedMemory {
    state: RwLock<State>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `base`. Regions must not overlap.
    pub fn map(&self, base: usize, bytes: &[u8]) -> &Self {
        self.state.write().regions.push(Region {
            base,
            bytes: bytes.to_vec(),
            locked: false,
            arena: None,
        });
        self
    }

    /// Map `len` zero bytes at `base`.
    pub fn map_zeroed(&self, base: usize, len: usize) -> &Self {
        self.map(base, &vec![0u8; len])
    }

    /// Map an executable arena of `len` bytes at `base` that serves
    /// [`PatchableMemory::alloc_code`].
    pub fn map_code_arena(&self, base: usize, len: usize) -> &Self {
        self.state.write().regions.push(Region {
            base,
            bytes: vec![ARENA_FILL; len],
            locked: false,
            arena: Some(0),
        });
        self
    }

    /// Refuse permission changes for the region containing `address`.
    ///
    /// Returns false when no region contains it.
    pub fn lock(&self, address: usize) -> bool {
        match self.state.write().region_mut(address, 1) {
            Some(region) => {
                region.locked = true;
                true
            }
            None => false,
        }
    }

    /// Number of successful writes outside code arenas.
    pub fn host_write_count(&self) -> usize {
        self.state.read().host_writes
    }
}

impl PatchableMemory for SimulatedMemory {
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        let state = self.state.read();
        let region = state
            .region(address, len)
            .ok_or(MemoryError::Unmapped { address, len })?;
        let start = address - region.base;
        Ok(region.bytes[start..start + len].to_vec())
    }

    fn write_with_permission_change(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut state = self.state.write();
        let region = state
            .region_mut(address, bytes.len())
            .ok_or(MemoryError::Unmapped {
                address,
                len: bytes.len(),
            })?;

        if region.locked {
            return Err(MemoryError::Protection {
                address,
                reason: "permission change refused".to_string(),
            });
        }

        let start = address - region.base;
        region.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        let is_arena = region.arena.is_some();

        if !is_arena {
            state.host_writes += 1;
        }
        Ok(())
    }

    fn alloc_code(&self, near: usize, size: usize) -> Result<usize, MemoryError> {
        let mut state = self.state.write();
        for region in &mut state.regions {
            let Some(used) = region.arena else {
                continue;
            };
            let start = used.next_multiple_of(ARENA_ALIGN);
            if within_range(region.base, near) && start + size <= region.bytes.len() {
                region.arena = Some(start + size);
                return Ok(region.base + start);
            }
        }

        Err(MemoryError::Exhausted { near, size })
    }
}
