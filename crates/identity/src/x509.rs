//! Pre-provisioned X.509 backend.
//!
//! The certificate and private key are written once per process by the
//! provisioning tooling and read by every context afterwards.

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;

use crate::backend::X509Hsm;
use crate::error::{HsmError, HsmResult};

/// Process-scoped certificate and key slots.
#[derive(Debug, Default)]
pub struct X509Store {
    certificate: OnceLock<String>,
    private_key: OnceLock<String>,
}

impl X509Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the PEM certificate. Only the first call succeeds.
    pub fn set_certificate(&self, certificate: &str) -> HsmResult<()> {
        set_once(&self.certificate, certificate, "certificate")
    }

    /// Store the PEM private key. Only the first call succeeds.
    pub fn set_key(&self, private_key: &str) -> HsmResult<()> {
        set_once(&self.private_key, private_key, "private key")
    }

    pub fn certificate(&self) -> HsmResult<String> {
        self.certificate
            .get()
            .cloned()
            .ok_or_else(|| HsmError::InvalidState("X.509 certificate not set".into()))
    }

    pub fn private_key(&self) -> HsmResult<String> {
        self.private_key
            .get()
            .cloned()
            .ok_or_else(|| HsmError::InvalidState("X.509 private key not set".into()))
    }

    /// Subject CN of the first certificate in the stored PEM.
    pub fn common_name(&self) -> HsmResult<String> {
        let certificate = self.certificate()?;
        common_name_of(&certificate)
    }
}

fn set_once(slot: &OnceLock<String>, value: &str, what: &str) -> HsmResult<()> {
    if value.is_empty() {
        return Err(HsmError::InvalidArgument(format!("X.509 {} is empty", what)));
    }
    slot.set(value.to_owned()).map_err(|_| {
        warn!("X509Store :: {} already set :: REJECTED", what);
        HsmError::ProtocolSequence(format!("X.509 {} may only be set once", what))
    })?;
    info!("X509Store :: {} :: SET", what);
    Ok(())
}

/// Parse the subject common name out of a PEM certificate.
pub fn common_name_of(pem: &str) -> HsmResult<String> {
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| HsmError::Certificate(format!("PEM parse failed: {}", e)))?;
    let certificate = pem
        .parse_x509()
        .map_err(|e| HsmError::Certificate(format!("X.509 parse failed: {}", e)))?;
    let common_name = certificate
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| HsmError::Certificate("certificate subject has no common name".into()))?
        .as_str()
        .map_err(|e| HsmError::Certificate(format!("common name is not a string: {}", e)))?;
    Ok(common_name.to_owned())
}

/// Backend context reading a shared [`X509Store`].
#[derive(Debug, Clone)]
pub struct StaticX509 {
    store: Arc<X509Store>,
}

impl StaticX509 {
    pub fn new(store: Arc<X509Store>) -> Self {
        Self { store }
    }
}

impl X509Hsm for StaticX509 {
    fn certificate(&self) -> HsmResult<String> {
        self.store.certificate()
    }

    fn alias_key(&self) -> HsmResult<String> {
        self.store.private_key()
    }

    fn common_name(&self) -> HsmResult<String> {
        self.store.common_name()
    }
}
