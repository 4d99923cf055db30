//! Patchable memory
//!
//! Every byte the engine reads from or writes into the host goes through
//! [`PatchableMemory`]. [`ProcessMemory`] talks to the live process;
//! [`SimulatedMemory`] is a byte-buffer address space used by tests.

mod process;
mod simulated;

pub use process::ProcessMemory;
pub use simulated::SimulatedMemory;

/// Maximum distance between a site and engine-owned code for rel32 reach (2GB)
pub const MAX_RANGE: usize = 0x7FFF_0000;

/// Error type for memory access
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("{len} bytes at {address:#x} are not mapped")]
    Unmapped { address: usize, len: usize },

    #[error("cannot make {address:#x} writable: {reason}")]
    Protection { address: usize, reason: String },

    #[error("no executable memory available near {near:#x} for {size} bytes")]
    Exhausted { near: usize, size: usize },
}

/// Address space the engine patches.
///
/// Implementations must be usable from the single initialization thread;
/// after installation nothing goes through this trait any more.
pub trait PatchableMemory {
    /// Copy `len` bytes starting at `address`.
    ///
    /// Fails with [`MemoryError::Unmapped`] when any part of the window is
    /// not readable.
    fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Write `bytes` at `address` as one contiguous write, temporarily
    /// granting write access and restoring the previous protection after.
    fn write_with_permission_change(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Allocate `size` bytes of executable memory, preferably within
    /// [`MAX_RANGE`] of `near`. The allocation lives for the process lifetime.
    fn alloc_code(&self, near: usize, size: usize) -> Result<usize, MemoryError>;

    /// Read one pointer-sized little-endian word.
    fn read_word(&self, address: usize) -> Result<usize, MemoryError> {
        let bytes = self.read(address, std::mem::size_of::<usize>())?;
        let mut word = [0u8; std::mem::size_of::<usize>()];
        word.copy_from_slice(&bytes);
        Ok(usize::from_le_bytes(word))
    }

    /// Write one pointer-sized word.
    fn write_word(&self, address: usize, value: usize) -> Result<(), MemoryError> {
        self.write_with_permission_change(address, &value.to_le_bytes())
    }
}

/// Whether `a` and `b` are within rel32 reach of each other
pub fn within_range(a: usize, b: usize) -> bool {
    a.abs_diff(b) < MAX_RANGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_range() {
        assert!(within_range(0x1_4000_0000, 0x1_4000_1000));
        assert!(within_range(0x1_4000_1000, 0x1_4000_0000));
        assert!(!within_range(0x1_4000_0000, 0x1_4000_0000 + MAX_RANGE));
    }

    #[test]
    fn test_word_helpers() {
        let memory = SimulatedMemory::new();
        memory.map_zeroed(0x1000, 0x100);
        memory.write_word(0x1008, 0xDEAD_BEEF).unwrap();
        assert_eq!(memory.read_word(0x1008).unwrap(), 0xDEAD_BEEF);
        assert_eq!(memory.read(0x1008, 4).unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }
}
