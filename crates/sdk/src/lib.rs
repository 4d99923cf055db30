//! Simple Dual Sheath SDK - Host Type Definitions
//!
//! Opaque host object types and the handful of object-model constants the
//! patch engine needs to read. It has no dependencies so it can be shared by
//! the engine and by collaborators written against the FFI bridge.
//!
//! # Modules
//!
//! - [`forms`] - Opaque form, reference and scene-graph types
//! - [`offsets`] - Field offsets and form type ids read by generated stubs

pub mod forms;
pub mod offsets;

pub use forms::*;
pub use offsets::{form_type, FORM_TYPE_OFFSET};
