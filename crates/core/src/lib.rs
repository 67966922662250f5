//! Core functionality for the Fleetlink edge-device agent.
//!
//! This crate provides the configuration, logging bootstrap and error types
//! shared across the Fleetlink crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{AgentConfig, LoggingConfig, RegistrationSettings};
pub use error::{CoreError, Result};
