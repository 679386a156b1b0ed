//! Configuration management for DevAuth.
//!
//! A single TOML document selects the device security type and carries the
//! per-backend settings. Sections other than `[security]` are optional and
//! fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Default common name placed in the RIoT alias certificate subject.
pub const DEFAULT_RIOT_COMMON_NAME: &str = "riot-device-cert";
/// Workload API version spoken by the edge signing service.
pub const DEFAULT_EDGE_API_VERSION: &str = "2018-06-28";
/// Wall-clock bound for a single edge request, in seconds.
pub const DEFAULT_EDGE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub security: SecurityConfig,
    #[serde(default)]
    pub tpm: TpmConfig,
    #[serde(default)]
    pub riot: RiotConfig,
    #[serde(default)]
    pub symmetric_key: SymmetricKeyConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
}

/// Secure device type the process is provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Tpm,
    /// Pre-provisioned certificate and key
    X509,
    /// Certificate chain derived from the RIoT/DICE measured boot
    Riot,
    SymmetricKey,
    HttpEdge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpmConfig {
    /// Talk to /dev/tpm* when available instead of the in-process stub
    #[serde(default)]
    pub use_hardware: bool,
    /// TCTI name-conf string, e.g. `device:/dev/tpmrm0`
    #[serde(default)]
    pub tcti: Option<String>,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            use_hardware: false,
            tcti: None,
        }
    }
}

/// Who signs the RIoT device certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCertSigning {
    /// Signed by an ephemeral root CA (group enrollment)
    RootSigned,
    /// Signed by the DeviceID key itself (individual enrollment)
    SelfSigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiotConfig {
    /// Hex-encoded unique device secret; reference value when absent
    #[serde(default)]
    pub uds: Option<String>,
    /// Hex-encoded RIoT core measurement
    #[serde(default)]
    pub measurement: Option<String>,
    /// Hex-encoded firmware id
    #[serde(default)]
    pub firmware_id: Option<String>,
    #[serde(default = "default_riot_common_name")]
    pub common_name: String,
    #[serde(default = "default_signing")]
    pub signing: DeviceCertSigning,
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
}

impl Default for RiotConfig {
    fn default() -> Self {
        Self {
            uds: None,
            measurement: None,
            firmware_id: None,
            common_name: default_riot_common_name(),
            signing: default_signing(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymmetricKeyConfig {
    #[serde(default)]
    pub registration_id: Option<String>,
    /// Base64-encoded device key
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default = "default_edge_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_edge_api_version")]
    pub api_version: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_edge_timeout(),
            api_version: default_edge_api_version(),
        }
    }
}

fn default_riot_common_name() -> String {
    DEFAULT_RIOT_COMMON_NAME.to_string()
}

fn default_signing() -> DeviceCertSigning {
    DeviceCertSigning::RootSigned
}

fn default_leaf_validity_days() -> u32 {
    30
}

fn default_edge_timeout() -> u64 {
    DEFAULT_EDGE_TIMEOUT_SECS
}

fn default_edge_api_version() -> String {
    DEFAULT_EDGE_API_VERSION.to_string()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            security: SecurityConfig {
                device_type: DeviceType::Tpm,
            },
            tpm: TpmConfig::default(),
            riot: RiotConfig::default(),
            symmetric_key: SymmetricKeyConfig::default(),
            edge: EdgeConfig::default(),
        }
    }

    /// Reject settings no backend could work with.
    pub fn validate(&self) -> Result<()> {
        if self.riot.common_name.trim().is_empty() {
            return Err(Error::Config("riot.common_name must not be empty".into()));
        }
        if self.riot.leaf_validity_days == 0 {
            return Err(Error::Config("riot.leaf_validity_days must be positive".into()));
        }
        if self.edge.timeout_secs == 0 {
            return Err(Error::Config("edge.timeout_secs must be positive".into()));
        }
        if self.edge.api_version.is_empty() {
            return Err(Error::Config("edge.api_version must not be empty".into()));
        }
        if let Some(key) = &self.symmetric_key.key {
            if key.is_empty() {
                return Err(Error::Config("symmetric_key.key must not be empty".into()));
            }
        }
        Ok(())
    }
}
