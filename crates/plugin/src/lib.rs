//! Simple Dual Sheath Plugin - FFI Layer
//!
//! This crate provides the FFI boundary between the host's plugin loader
//! and the Rust patch engine. It compiles to a cdylib (.dll/.so).

pub mod ffi;
