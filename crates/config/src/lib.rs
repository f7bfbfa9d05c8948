//! Configuration module for the codec benchmark engine
//!
//! Handles loading configuration from TOML files, environment variable
//! overrides, and the codec/metric catalog.

pub mod catalog;
pub mod config;

pub use catalog::*;
pub use config::*;
