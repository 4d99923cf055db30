//! VTable hooks via pointer replacement
//!
//! A virtual dispatch slot is read, kept as the original entry, and
//! overwritten with the replacement in a single word write.

use crate::memory::PatchableMemory;
use crate::sites::SiteId;

use super::{HookError, OriginalEntry};

/// Replaces slots of virtual dispatch tables.
pub struct VTablePatcher<'m, M: PatchableMemory + ?Sized> {
    memory: &'m M,
}

impl<'m, M: PatchableMemory + ?Sized> VTablePatcher<'m, M> {
    pub fn new(memory: &'m M) -> Self {
        Self { memory }
    }

    /// Hook a virtual table entry
    ///
    /// # Arguments
    /// * `site` - Identifier the hook is reported and registered under
    /// * `table` - Address of the vtable
    /// * `index` - Index of the virtual function in the vtable
    /// * `replacement` - Address written into the slot
    ///
    /// # Returns
    /// The previous slot value as an [`OriginalEntry::Slot`]
    pub fn patch_slot(
        &self,
        site: SiteId,
        table: usize,
        index: usize,
        replacement: usize,
    ) -> Result<OriginalEntry, HookError> {
        let slot = table + index * std::mem::size_of::<usize>();

        let original = self
            .memory
            .read_word(slot)
            .map_err(|e| HookError::DependencyMissing {
                site,
                what: format!("vtable slot {} unreadable: {}", index, e),
            })?;
        if original == 0 {
            return Err(HookError::DependencyMissing {
                site,
                what: format!("vtable slot {} at {:x} is empty", index, slot),
            });
        }

        tracing::debug!(
            "Creating vtable hook '{}': vtable={:x}, slot[{}]={:x}, original={:x}",
            site,
            table,
            index,
            slot,
            original
        );

        self.memory
            .write_word(slot, replacement)
            .map_err(|e| HookError::write(site, e))?;

        tracing::info!("Created vtable hook '{}' at index {}", site, index);

        Ok(OriginalEntry::Slot(original))
    }
}
