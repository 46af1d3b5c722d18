//! # vessel-common
//!
//! Shared utilities and types for the Vessel execution engine.
//!
//! This crate provides functionality used across the Vessel crates:
//! - Administrator configuration directives
//! - Standard filesystem paths
//! - Logging initialization
//! - Common error types

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use config::EngineConfig;
pub use error::{VesselError, VesselResult};
pub use paths::VesselPaths;
