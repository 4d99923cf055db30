//! Memory validation
//!
//! Every site an activation needs is checked against its signatures before
//! any byte is written. Failures are collected as flags so one report can
//! name all of them.

use bitflags::bitflags;

use crate::hooks::PatchSite;
use crate::memory::PatchableMemory;
use crate::sites::SiteId;

bitflags! {
    /// One flag per signature-checked site, set when its check failed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryValidationFlags: u32 {
        const CREATE_WEAPON_NODES = 1 << 0;
        const SCABBARD_ATTACH = 1 << 1;
        const SCABBARD_DETACH = 1 << 2;
        const SHIELD_ATTACH = 1 << 3;
        const DISABLE_SHIELD_HIDE_ON_SIT = 1 << 4;
        const SHIELD_HAND_GRAPH_VARIABLE = 1 << 5;
        const SHIELD_HAND_HOLDER_VARIABLE = 1 << 6;
        const SHIELD_HAND_LEFT_HAND_SYNC = 1 << 7;
        const CREATE_ARMOR_NODE = 1 << 8;
    }
}

impl MemoryValidationFlags {
    /// Sites whose flags are set, in catalog order
    pub fn sites(self) -> impl Iterator<Item = SiteId> {
        SiteId::ALL.into_iter().filter(move |id| {
            let flag = id.validation_flag();
            !flag.is_empty() && self.contains(flag)
        })
    }

    /// Comma-separated site names, e.g. `"ScabbardAttach, ScabbardDetach"`
    pub fn describe(self) -> String {
        self.sites()
            .map(SiteId::name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Validate every site, returning the flags of those that failed.
///
/// Each site remembers which of its signatures matched.
pub fn validate_sites<'a, M, I>(memory: &M, sites: I) -> MemoryValidationFlags
where
    M: PatchableMemory + ?Sized,
    I: IntoIterator<Item = &'a mut PatchSite>,
{
    let mut failed = MemoryValidationFlags::empty();
    for site in sites {
        if !site.validate(memory) {
            tracing::debug!("Validation failed for {} at {:x}", site.id(), site.address());
            failed |= site.id().validation_flag();
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimulatedMemory;
    use crate::sites::site_spec;

    #[test]
    fn test_describe_lists_names_in_order() {
        let flags = MemoryValidationFlags::SCABBARD_DETACH | MemoryValidationFlags::SCABBARD_ATTACH;
        assert_eq!(flags.describe(), "ScabbardAttach, ScabbardDetach");
        assert_eq!(MemoryValidationFlags::empty().describe(), "");
    }

    #[test]
    fn test_every_flag_has_a_site() {
        let named = MemoryValidationFlags::all().sites().count();
        assert_eq!(named, MemoryValidationFlags::all().iter().count());
    }

    #[test]
    fn test_validate_sites_collects_failures() {
        let memory = SimulatedMemory::new();
        memory.map(0x1000, &[0x40, 0x56, 0x57, 0x41, 0x54, 0x41, 0x56]);
        memory.map(0x2000, &[0x90; 8]);

        let mut sites = vec![
            site_spec(SiteId::CreateWeaponNodes).unwrap().at(0x1000),
            site_spec(SiteId::ScabbardAttach).unwrap().at(0x2000),
        ];
        let failed = validate_sites(&memory, sites.iter_mut());

        assert_eq!(failed, MemoryValidationFlags::SCABBARD_ATTACH);
        assert!(sites[0].is_validated());
        assert!(!sites[1].is_validated());
        assert_eq!(memory.host_write_count(), 0);
    }
}
