//! Core types and configuration for kiln.
//!
//! This crate defines the `kiln.toml` schema ([`KilnConfig`]), version
//! normalization ([`strip_patch_version`]), the torch/CUDA compatibility
//! table, and shared error types.

pub mod accelerator;
pub mod config;
pub mod error;
pub mod platform;
pub mod version;

pub use config::{BuildConfig, KilnConfig, RunItem, RunMount};
pub use error::{Error, Result};
pub use platform::Platform;
pub use version::strip_patch_version;
