//! Install planning
//!
//! Turns the configuration and the resolved layout into the list of features
//! to activate, each with the sites it patches. Validation runs over the
//! whole plan before anything is written.

use std::fmt;

use crate::config::EngineConfig;
use crate::hooks::{HookError, PatchSite};
use crate::layout::{LayoutError, ResolvedLayout};
use crate::memory::PatchableMemory;
use crate::sites::{site_spec, SiteId};
use crate::validation::{validate_sites, MemoryValidationFlags};

/// Whether a failing feature aborts activation or is only disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Requirement {
    Mandatory,
    Optional,
}

/// A group of sites that is activated or dropped as a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    WeaponNodes,
    Scabbards,
    ShieldAttach,
    ShieldHideOnSit,
    ShieldHandWorkaround,
    EquipSlotTracking,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::WeaponNodes,
        Feature::Scabbards,
        Feature::ShieldAttach,
        Feature::ShieldHideOnSit,
        Feature::ShieldHandWorkaround,
        Feature::EquipSlotTracking,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Feature::WeaponNodes => "WeaponNodes",
            Feature::Scabbards => "Scabbards",
            Feature::ShieldAttach => "ShieldAttach",
            Feature::ShieldHideOnSit => "ShieldHideOnSit",
            Feature::ShieldHandWorkaround => "ShieldHandWorkaround",
            Feature::EquipSlotTracking => "EquipSlotTracking",
        }
    }

    pub const fn sites(self) -> &'static [SiteId] {
        match self {
            Feature::WeaponNodes => &[SiteId::CreateWeaponNodes],
            Feature::Scabbards => &[SiteId::ScabbardAttach, SiteId::ScabbardDetach],
            Feature::ShieldAttach => &[SiteId::CreateArmorNode, SiteId::ShieldAttach],
            Feature::ShieldHideOnSit => &[SiteId::DisableShieldHideOnSit],
            Feature::ShieldHandWorkaround => &[
                SiteId::ShieldHandGraphVariable,
                SiteId::ShieldHandHolderVariable,
                SiteId::ShieldHandLeftHandSync,
            ],
            Feature::EquipSlotTracking => &[SiteId::WeaponSetEquipSlot],
        }
    }

    pub const fn requirement(self) -> Requirement {
        match self {
            Feature::ShieldHandWorkaround | Feature::EquipSlotTracking => Requirement::Optional,
            _ => Requirement::Mandatory,
        }
    }

    /// Whether `config` asks for this feature
    pub fn enabled(self, config: &EngineConfig) -> bool {
        match self {
            Feature::WeaponNodes => true,
            Feature::Scabbards => config.scabbards,
            Feature::ShieldAttach => config.shield.enabled,
            Feature::ShieldHideOnSit => config.shield.hide_on_sit,
            Feature::ShieldHandWorkaround => config.shield.enabled && config.shield.hand_workaround,
            Feature::EquipSlotTracking => config.two_handed_left,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One enabled feature and where its sites are
pub(crate) struct PlannedFeature {
    pub(crate) feature: Feature,
    pub(crate) sites: Vec<PatchSite>,
    pub(crate) vtable: Option<usize>,
    /// Why an optional feature cannot be attempted at all
    pub(crate) unavailable: Option<HookError>,
}

impl PlannedFeature {
    pub(crate) fn requirement(&self) -> Requirement {
        self.feature.requirement()
    }
}

/// Every feature an activation attempts, mandatory ones first
pub struct InstallPlan {
    pub(crate) features: Vec<PlannedFeature>,
}

impl InstallPlan {
    /// Plan the features `config` enables at the addresses in `layout`.
    ///
    /// A mandatory site missing from the layout is an error; a missing
    /// optional one only marks its feature unavailable.
    pub fn new(layout: &ResolvedLayout, config: &EngineConfig) -> Result<Self, LayoutError> {
        let mut features = Vec::new();

        for feature in Feature::ALL.into_iter().filter(|f| f.enabled(config)) {
            let mut planned = PlannedFeature {
                feature,
                sites: Vec::new(),
                vtable: None,
                unavailable: None,
            };

            for &id in feature.sites() {
                let located = match site_spec(id) {
                    Some(spec) => layout.address(id).map(|address| planned.sites.push(spec.at(address))),
                    None => layout.weapon_vtable().map(|table| planned.vtable = Some(table)),
                };

                if let Err(e) = located {
                    if feature.requirement() == Requirement::Mandatory {
                        return Err(e);
                    }
                    tracing::debug!("{} unavailable: {}", feature, e);
                    planned.unavailable = Some(HookError::DependencyMissing {
                        site: id,
                        what: e.to_string(),
                    });
                    planned.sites.clear();
                    planned.vtable = None;
                    break;
                }
            }

            features.push(planned);
        }

        features.sort_by_key(|planned| planned.requirement());
        Ok(Self { features })
    }

    /// The features in installation order
    pub fn features(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().map(|planned| planned.feature)
    }

    /// Signature-checked sites of every attempted feature, guards included
    pub fn sites(&self) -> impl Iterator<Item = &PatchSite> {
        self.features.iter().flat_map(|planned| planned.sites.iter())
    }

    /// Check every site's signature. Never writes.
    ///
    /// Returns the flags of all failed sites, mandatory or not.
    pub fn validate<M: PatchableMemory + ?Sized>(&mut self, memory: &M) -> MemoryValidationFlags {
        validate_sites(
            memory,
            self.features.iter_mut().flat_map(|planned| planned.sites.iter_mut()),
        )
    }

    /// The part of `failed` that belongs to mandatory features
    pub fn fatal_flags(&self, failed: MemoryValidationFlags) -> MemoryValidationFlags {
        self.features
            .iter()
            .filter(|planned| planned.requirement() == Requirement::Mandatory)
            .flat_map(|planned| planned.sites.iter())
            .map(|site| site.id().validation_flag())
            .fold(MemoryValidationFlags::empty(), |acc, flag| acc | flag)
            & failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimulatedMemory;

    fn full_layout() -> ResolvedLayout {
        SiteId::ALL
            .into_iter()
            .filter(|id| site_spec(*id).is_some())
            .enumerate()
            .fold(ResolvedLayout::new(), |layout, (i, id)| {
                layout.with_site(id, 0x1_4000_0000 + i * 0x1000)
            })
            .with_weapon_vtable(0x1_4100_0000)
    }

    #[test]
    fn test_default_config_features() {
        let plan = InstallPlan::new(&full_layout(), &EngineConfig::default()).unwrap();
        let features: Vec<_> = plan.features().collect();

        assert_eq!(
            features,
            vec![
                Feature::WeaponNodes,
                Feature::Scabbards,
                Feature::ShieldAttach,
                Feature::ShieldHandWorkaround,
            ]
        );
    }

    #[test]
    fn test_optional_features_come_last() {
        let mut config = EngineConfig::default();
        config.two_handed_left = true;
        config.shield.hide_on_sit = true;

        let plan = InstallPlan::new(&full_layout(), &config).unwrap();
        let requirements: Vec<_> = plan.features().map(Feature::requirement).collect();
        let mut sorted = requirements.clone();
        sorted.sort();
        assert_eq!(requirements, sorted);
        assert_eq!(plan.features().last(), Some(Feature::EquipSlotTracking));
    }

    #[test]
    fn test_missing_mandatory_site() {
        let layout = ResolvedLayout::new().with_site(SiteId::CreateWeaponNodes, 0x1000);
        let err = InstallPlan::new(&layout, &EngineConfig::default()).err().unwrap();
        assert!(matches!(err, LayoutError::SiteNotFound(SiteId::ScabbardAttach)));
    }

    #[test]
    fn test_missing_optional_site_marks_unavailable() {
        let config = EngineConfig {
            scabbards: false,
            two_handed_left: true,
            ..Default::default()
        };
        let layout = ResolvedLayout::new()
            .with_site(SiteId::CreateWeaponNodes, 0x1000)
            .with_site(SiteId::CreateArmorNode, 0x1800)
            .with_site(SiteId::ShieldAttach, 0x2000)
            .with_site(SiteId::ShieldHandGraphVariable, 0x3000);

        let plan = InstallPlan::new(&layout, &config).unwrap();
        let hand = plan
            .features
            .iter()
            .find(|p| p.feature == Feature::ShieldHandWorkaround)
            .unwrap();
        assert!(hand.sites.is_empty());
        assert!(matches!(
            hand.unavailable,
            Some(HookError::DependencyMissing {
                site: SiteId::ShieldHandHolderVariable,
                ..
            })
        ));

        let equip = plan
            .features
            .iter()
            .find(|p| p.feature == Feature::EquipSlotTracking)
            .unwrap();
        assert!(equip.unavailable.is_some());
    }

    #[test]
    fn test_armor_node_checked_only_with_shield() {
        let plan = InstallPlan::new(&full_layout(), &EngineConfig::default()).unwrap();
        assert!(plan.sites().any(|site| site.id() == SiteId::CreateArmorNode));

        let mut config = EngineConfig::default();
        config.shield.enabled = false;
        let plan = InstallPlan::new(&full_layout(), &config).unwrap();
        assert!(plan.sites().all(|site| site.id() != SiteId::CreateArmorNode));
    }

    #[test]
    fn test_fatal_flags_ignore_optional_sites() {
        let memory = SimulatedMemory::new();
        let mut plan = InstallPlan::new(&full_layout(), &EngineConfig::default()).unwrap();

        let failed = plan.validate(&memory);
        assert!(failed.contains(MemoryValidationFlags::SHIELD_HAND_GRAPH_VARIABLE));

        let fatal = plan.fatal_flags(failed);
        assert_eq!(
            fatal,
            MemoryValidationFlags::CREATE_WEAPON_NODES
                | MemoryValidationFlags::SCABBARD_ATTACH
                | MemoryValidationFlags::SCABBARD_DETACH
                | MemoryValidationFlags::CREATE_ARMOR_NODE
                | MemoryValidationFlags::SHIELD_ATTACH
        );
    }
}
