//! Simple Dual Sheath - Patch Engine
//!
//! Validates fixed sites in the host's code, redirects them into generated
//! stubs that call the engine's handlers, keeps a path back to the original
//! code, and publishes what the handlers observe to registered sinks.
//!
//! # Re-exports
//!
//! - [`sdk`] - Host object types and layout constants

pub use sheath_sdk as sdk;

pub mod config;
pub mod controller;
pub mod engine;
pub mod events;
mod handlers;
pub mod hooks;
pub mod layout;
pub mod memory;
pub mod signature;
pub mod sites;
pub mod stub;
pub mod validation;

// Re-export commonly used items
pub use config::{ConfigError, ConfigResult, EngineConfig, ShieldConfig};
pub use controller::Controller;
pub use engine::{
    initialize, Activation, ActivationError, EngineExtensions, Feature, InstallPlan, InstallReport,
    Requirement,
};
pub use events::{
    CreateWeaponNodesEvent, DispatchedEvent, Dispatchers, EventDispatcher, EventSink,
    SetEquipSlotEvent,
};
pub use hooks::{HookError, OriginalEntry, OriginalRegistry, PatchKind, PatchSite};
pub use layout::{HostLayout, LayoutError, ResolvedLayout};
pub use memory::{MemoryError, PatchableMemory, ProcessMemory, SimulatedMemory};
pub use sites::SiteId;
pub use validation::MemoryValidationFlags;
