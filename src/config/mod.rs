//! Configuration module
//!
//! Loads bridge settings from TOML and derives the per-layer options.

mod settings;

pub use settings::*;
