//! Signature validation
//!
//! A site is only patched when the bytes at its address equal one of the
//! byte sequences the engine was written against.

use std::fmt;

use crate::memory::PatchableMemory;

/// Return the index of the first candidate whose bytes equal the window of
/// the same length at `address`.
///
/// Empty candidates never match. A window that cannot be read in full counts
/// as a mismatch.
pub fn match_signature<M: PatchableMemory + ?Sized>(
    memory: &M,
    address: usize,
    signatures: &[&[u8]],
) -> Option<usize> {
    signatures.iter().position(|signature| {
        !signature.is_empty()
            && memory
                .read(address, signature.len())
                .is_ok_and(|window| window == *signature)
    })
}

/// Check whether the bytes at `address` equal any candidate signature.
pub fn validate<M: PatchableMemory + ?Sized>(
    memory: &M,
    address: usize,
    signatures: &[&[u8]],
) -> bool {
    match_signature(memory, address, signatures).is_some()
}

/// Displays bytes as `{ 40 56 57 }` for diagnostics
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for byte in self.0 {
            write!(f, " {:02X}", byte)?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimulatedMemory;

    const PROLOGUE: &[u8] = &[0x40, 0x56, 0x57, 0x41, 0x54, 0x41, 0x56];

    fn memory_with(bytes: &[u8]) -> SimulatedMemory {
        let memory = SimulatedMemory::new();
        memory.map(0x1000, bytes);
        memory
    }

    #[test]
    fn test_exact_match() {
        let memory = memory_with(PROLOGUE);
        assert!(validate(&memory, 0x1000, &[PROLOGUE]));
    }

    #[test]
    fn test_single_byte_difference() {
        let mut bytes = PROLOGUE.to_vec();
        bytes[4] = 0x55;
        let memory = memory_with(&bytes);
        assert!(!validate(&memory, 0x1000, &[PROLOGUE]));
    }

    #[test]
    fn test_second_candidate_matches() {
        let memory = memory_with(&[0xE9, 0x00, 0x00, 0x00, 0x00]);
        let signatures: &[&[u8]] = &[&[0x48, 0x85, 0xC0, 0x74, 0x0D], &[0xE9]];
        assert_eq!(match_signature(&memory, 0x1000, signatures), Some(1));
    }

    #[test]
    fn test_window_shorter_than_signature() {
        // Only four bytes remain before the end of the region
        let memory = memory_with(&PROLOGUE[..4]);
        assert!(!validate(&memory, 0x1000, &[PROLOGUE]));
    }

    #[test]
    fn test_unmapped_address() {
        let memory = memory_with(PROLOGUE);
        assert!(!validate(&memory, 0x9000, &[PROLOGUE]));
    }

    #[test]
    fn test_empty_signature_never_matches() {
        let memory = memory_with(PROLOGUE);
        assert!(!validate(&memory, 0x1000, &[&[]]));
        assert!(!validate(&memory, 0x1000, &[]));
    }

    #[test]
    fn test_validation_does_not_write() {
        let memory = memory_with(PROLOGUE);
        let _ = validate(&memory, 0x1000, &[PROLOGUE]);
        assert_eq!(memory.host_write_count(), 0);
        assert_eq!(memory.read(0x1000, PROLOGUE.len()).unwrap(), PROLOGUE);
    }

    #[test]
    fn test_hex_bytes_display() {
        assert_eq!(HexBytes(&[0x80, 0x7D, 0x6F]).to_string(), "{ 80 7D 6F }");
    }
}
