//! C-compatible surface of the plugin

pub mod bridge;
pub mod exports;

pub use bridge::{ControllerCallbacks, FfiController};
