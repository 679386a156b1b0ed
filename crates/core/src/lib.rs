//! Core functionality shared across the DevAuth workspace.
//!
//! This crate provides the configuration model, logging initialization and
//! the core error type used by the identity and credential crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, DeviceCertSigning, DeviceType, EdgeConfig, RiotConfig, SecurityConfig,
    SymmetricKeyConfig, TpmConfig,
};
pub use error::{Error, Result};
