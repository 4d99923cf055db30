//! Engine extensions
//!
//! [`EngineExtensions`] owns everything handlers need at runtime: the
//! configuration, the controller, the event dispatchers, and the original
//! entries of every installed hook. [`EngineExtensions::install`] validates
//! the plan, then patches each feature, mandatory ones first.

mod plan;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::controller::Controller;
use crate::events::Dispatchers;
use crate::handlers::handler_address;
use crate::hooks::{
    resolve_call_target, HookError, HookInstaller, OriginalRegistry, PatchKind, VTablePatcher,
};
use crate::layout::{LayoutError, ResolvedLayout};
use crate::memory::PatchableMemory;
use crate::sites::{stub_program, SiteId, SET_EQUIP_SLOT_INDEX};
use crate::stub::StubGenerator;
use crate::validation::MemoryValidationFlags;

pub use plan::{Feature, InstallPlan, Requirement};
use plan::PlannedFeature;

/// Why activation was aborted
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// Mandatory sites did not match; nothing was written
    #[error("Memory validation failed ({description})")]
    Validation {
        flags: MemoryValidationFlags,
        description: String,
    },

    /// A mandatory feature failed while being installed
    #[error("{feature}: {source}")]
    Install {
        feature: Feature,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// What an activation ended up doing
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Sites now redirected into the engine, including those a degraded
    /// feature had already patched when it failed
    pub installed: Vec<SiteId>,
    /// Features fully installed
    pub active: Vec<Feature>,
    /// Optional features that were dropped, with the reason
    pub degraded: Vec<(Feature, HookError)>,
}

impl InstallReport {
    pub fn is_active(&self, feature: Feature) -> bool {
        self.active.contains(&feature)
    }

    pub fn is_degraded(&self, feature: Feature) -> bool {
        self.degraded.iter().any(|(f, _)| *f == feature)
    }
}

/// A successful activation
pub struct Activation {
    pub engine: &'static EngineExtensions,
    pub report: InstallReport,
}

/// Runtime state shared by every handler.
pub struct EngineExtensions {
    config: EngineConfig,
    controller: Arc<dyn Controller>,
    dispatchers: Dispatchers,
    originals: OriginalRegistry,
}

impl EngineExtensions {
    pub fn new(config: EngineConfig, controller: Arc<dyn Controller>) -> Self {
        Self {
            config,
            controller,
            dispatchers: Dispatchers::new(),
            originals: OriginalRegistry::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn controller(&self) -> &dyn Controller {
        &*self.controller
    }

    /// Event dispatchers collaborators register their sinks with
    pub fn dispatchers(&self) -> &Dispatchers {
        &self.dispatchers
    }

    pub fn originals(&self) -> &OriginalRegistry {
        &self.originals
    }

    /// Validate and install `plan`.
    ///
    /// When a mandatory site fails validation nothing is written and the
    /// error names every failed site. Otherwise the engine is leaked so
    /// generated code can refer to it, and features are installed in plan
    /// order. A mandatory feature failing aborts with the sites installed so
    /// far left in place; an optional one is reported as degraded, and any
    /// of its sites already patched stay in [`InstallReport::installed`].
    pub fn install<M: PatchableMemory + ?Sized>(
        plan: &mut InstallPlan,
        memory: &M,
        config: EngineConfig,
        controller: Arc<dyn Controller>,
    ) -> Result<Activation, ActivationError> {
        let failed = plan.validate(memory);
        let fatal = plan.fatal_flags(failed);
        if !fatal.is_empty() {
            let description = fatal.describe();
            error!("Memory validation failed ({}), aborting", description);
            return Err(ActivationError::Validation {
                flags: fatal,
                description,
            });
        }

        let engine: &'static EngineExtensions = Box::leak(Box::new(Self::new(config, controller)));
        let context = engine as *const EngineExtensions as usize;

        let mut report = InstallReport::default();
        for planned in &mut plan.features {
            let feature = planned.feature;
            let mut installed = Vec::new();
            let result = engine.install_feature(memory, planned, failed, context, &mut installed);
            let patched = installed.len();
            report.installed.extend(installed);

            match result {
                Ok(()) => {
                    info!("Activated {} ({} sites)", feature, patched);
                    report.active.push(feature);
                }
                Err(source) if planned.requirement() == Requirement::Mandatory => {
                    error!("Failed to install {}: {}", feature, source);
                    return Err(ActivationError::Install { feature, source });
                }
                Err(source) => {
                    if patched > 0 {
                        warn!("{} disabled with {} sites left patched: {}", feature, patched, source);
                    } else {
                        warn!("{} disabled: {}", feature, source);
                    }
                    report.degraded.push((feature, source));
                }
            }
        }

        Ok(Activation { engine, report })
    }

    /// Install one feature, pushing every site it patches onto `installed`
    /// as soon as that site is live.
    fn install_feature<M: PatchableMemory + ?Sized>(
        &self,
        memory: &M,
        planned: &mut PlannedFeature,
        failed: MemoryValidationFlags,
        context: usize,
        installed: &mut Vec<SiteId>,
    ) -> Result<(), HookError> {
        if let Some(e) = planned.unavailable.take() {
            return Err(e);
        }

        // Everything the feature needs is checked before its first write
        for site in &planned.sites {
            if failed.intersects(site.id().validation_flag()) {
                return Err(HookError::SignatureMismatch {
                    site: site.id(),
                    address: site.address(),
                });
            }
            if site.kind() == PatchKind::CallTarget
                && resolve_call_target(memory, site.address()).is_none()
            {
                return Err(HookError::DependencyMissing {
                    site: site.id(),
                    what: format!("call target at {:x} could not be resolved", site.address()),
                });
            }
        }

        let generator = StubGenerator::new(memory);
        let installer = HookInstaller::new(memory);

        for site in &mut planned.sites {
            let id = site.id();
            let Some(program) = stub_program(id) else {
                continue;
            };
            let descriptor = generator
                .build(site, &program, handler_address(id), context)
                .map_err(|source| HookError::Stub { site: id, source })?;
            let original = installer.install(site, &descriptor)?;
            installed.push(id);
            self.originals.insert(id, original)?;
        }

        if let Some(table) = planned.vtable {
            let id = SiteId::WeaponSetEquipSlot;
            let program = stub_program(id).ok_or(HookError::NotPatchable { site: id })?;
            let thunk = generator
                .build_detached(table, &program, handler_address(id), context)
                .map_err(|source| HookError::Stub { site: id, source })?;
            let original = VTablePatcher::new(memory).patch_slot(id, table, SET_EQUIP_SLOT_INDEX, thunk)?;
            installed.push(id);
            self.originals.insert(id, original)?;
        }

        Ok(())
    }
}

/// Plan from `layout` and `config`, then install.
pub fn initialize<M: PatchableMemory + ?Sized>(
    layout: &ResolvedLayout,
    memory: &M,
    config: EngineConfig,
    controller: Arc<dyn Controller>,
) -> Result<Activation, ActivationError> {
    let mut plan = InstallPlan::new(layout, &config)?;
    EngineExtensions::install(&mut plan, memory, config, controller)
}
