#![forbid(unsafe_code)]
//! EmberFS public API facade.
//!
//! Re-exports the analysis surface from `efs-core` through one stable
//! external interface. This is the crate downstream consumers (CLI,
//! harness, scripts) depend on.

pub use efs_core::*;
