//! Symmetric-key backend.

use tracing::info;
use zeroize::Zeroizing;

use devauth_core::SymmetricKeyConfig;

use crate::backend::KeyHsm;
use crate::error::{HsmError, HsmResult};

struct KeyInfo {
    registration_name: String,
    key: Zeroizing<String>,
}

/// Registration name and base64 device key held in memory.
#[derive(Default)]
pub struct SymmetricKeyStore {
    info: Option<KeyInfo>,
}

impl SymmetricKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from configuration when both values are present.
    pub fn from_config(config: &SymmetricKeyConfig) -> HsmResult<Self> {
        let mut store = Self::new();
        match (&config.registration_id, &config.key) {
            (Some(name), Some(key)) => store.set_key_info(name, key)?,
            (None, None) => {}
            _ => {
                return Err(HsmError::Config(
                    "symmetric_key needs both registration_id and key".into(),
                ))
            }
        }
        Ok(store)
    }

    fn info(&self) -> HsmResult<&KeyInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| HsmError::InvalidState("symmetric key info not set".into()))
    }
}

impl KeyHsm for SymmetricKeyStore {
    fn symmetric_key(&self) -> HsmResult<String> {
        Ok(self.info()?.key.as_str().to_owned())
    }

    fn registration_name(&self) -> HsmResult<String> {
        Ok(self.info()?.registration_name.clone())
    }

    fn set_key_info(&mut self, registration_name: &str, symmetric_key: &str) -> HsmResult<()> {
        if registration_name.is_empty() || symmetric_key.is_empty() {
            return Err(HsmError::InvalidArgument(
                "registration name and symmetric key are required".into(),
            ));
        }
        let replacement = KeyInfo {
            registration_name: registration_name.to_owned(),
            key: Zeroizing::new(symmetric_key.to_owned()),
        };
        self.info = Some(replacement);
        info!("SymmetricKeyStore :: Key info for {} :: SET", registration_name);
        Ok(())
    }
}

impl std::fmt::Debug for SymmetricKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKeyStore")
            .field(
                "registration_name",
                &self.info.as_ref().map(|i| i.registration_name.as_str()),
            )
            .finish_non_exhaustive()
    }
}
