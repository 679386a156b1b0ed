//! HSM backend abstraction.
//!
//! Every secret store exposes one capability set. A created backend is
//! wrapped in an [`HsmHandle`] whose variant names that set, so a context
//! can only reach operations its backend actually provides.

use std::fmt;

use devauth_core::DeviceType;

use crate::error::{HsmError, HsmResult};

/// Backend variants a process can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Tpm,
    X509Static,
    X509Riot,
    SymmetricKey,
    HttpEdge,
}

impl BackendKind {
    pub fn from_device_type(device_type: DeviceType) -> Self {
        match device_type {
            DeviceType::Tpm => BackendKind::Tpm,
            DeviceType::X509 => BackendKind::X509Static,
            DeviceType::Riot => BackendKind::X509Riot,
            DeviceType::SymmetricKey => BackendKind::SymmetricKey,
            DeviceType::HttpEdge => BackendKind::HttpEdge,
        }
    }

    /// Whether a handle of this kind carries the X.509 capability set.
    pub fn is_x509(self) -> bool {
        matches!(self, BackendKind::X509Static | BackendKind::X509Riot)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Tpm => "tpm",
            BackendKind::X509Static => "x509",
            BackendKind::X509Riot => "riot",
            BackendKind::SymmetricKey => "symmetric_key",
            BackendKind::HttpEdge => "http_edge",
        };
        f.write_str(name)
    }
}

pub(crate) fn unsupported(operation: &str) -> HsmError {
    HsmError::ProtocolSequence(format!("{} is not supported by this backend", operation))
}

/// TPM capability set.
pub trait TpmHsm {
    /// Marshaled TPM2B_PUBLIC of the endorsement key.
    fn endorsement_key(&self) -> HsmResult<Vec<u8>>;
    /// Marshaled TPM2B_PUBLIC of the storage root key.
    fn storage_key(&self) -> HsmResult<Vec<u8>>;
    /// Activate and persist the identity key from a service activation blob.
    fn import_key(&mut self, blob: &[u8]) -> HsmResult<()>;
    /// HMAC-SHA256 with the persisted identity key.
    fn sign_data(&mut self, data: &[u8]) -> HsmResult<Vec<u8>>;
}

/// X.509 capability set.
///
/// The chain extras are only offered by the RIoT backend.
pub trait X509Hsm {
    /// PEM certificate chain presented for TLS client authentication.
    fn certificate(&self) -> HsmResult<String>;
    /// PEM private key matching the leaf of [`certificate`](Self::certificate).
    fn alias_key(&self) -> HsmResult<String>;
    /// Subject common name of the device certificate.
    fn common_name(&self) -> HsmResult<String>;

    fn signer_cert(&self) -> HsmResult<String> {
        Err(unsupported("signer certificate"))
    }

    fn root_cert(&self) -> HsmResult<String> {
        Err(unsupported("root certificate"))
    }

    fn root_key(&self) -> HsmResult<String> {
        Err(unsupported("root key"))
    }

    /// Issue a leaf certificate for `common_name` under the root key.
    fn create_leaf_cert(&self, _common_name: &str) -> HsmResult<String> {
        Err(unsupported("leaf certificate issuance"))
    }
}

/// Symmetric-key capability set.
pub trait KeyHsm {
    /// Base64 encoded device key.
    fn symmetric_key(&self) -> HsmResult<String>;
    fn registration_name(&self) -> HsmResult<String>;
    /// Replace both values; on error the previous values stay in place.
    fn set_key_info(&mut self, registration_name: &str, symmetric_key: &str) -> HsmResult<()>;
}

/// Edge workload capability set.
pub trait EdgeHsm {
    /// Sign a `"<scope>\n<expiry>"` payload; returns the raw HMAC bytes.
    fn sign_data(&mut self, data: &[u8]) -> HsmResult<Vec<u8>>;
    /// PEM trust bundle published by the edge runtime.
    fn trust_bundle(&mut self) -> HsmResult<String>;
}

/// Owned backend context, tagged by capability set.
///
/// Dropping the handle destroys the backend exactly once.
pub enum HsmHandle {
    Tpm(Box<dyn TpmHsm>),
    X509(Box<dyn X509Hsm>),
    SymmetricKey(Box<dyn KeyHsm>),
    HttpEdge(Box<dyn EdgeHsm>),
}

impl HsmHandle {
    /// Whether this handle carries the capability set `kind` requires.
    pub fn satisfies(&self, kind: BackendKind) -> bool {
        match self {
            HsmHandle::Tpm(_) => kind == BackendKind::Tpm,
            HsmHandle::X509(_) => kind.is_x509(),
            HsmHandle::SymmetricKey(_) => kind == BackendKind::SymmetricKey,
            HsmHandle::HttpEdge(_) => kind == BackendKind::HttpEdge,
        }
    }

    pub fn capability_name(&self) -> &'static str {
        match self {
            HsmHandle::Tpm(_) => "tpm",
            HsmHandle::X509(_) => "x509",
            HsmHandle::SymmetricKey(_) => "symmetric_key",
            HsmHandle::HttpEdge(_) => "http_edge",
        }
    }
}

impl fmt::Debug for HsmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HsmHandle")
            .field(&self.capability_name())
            .finish()
    }
}

/// Creates backend contexts of one kind.
pub trait HsmFactory: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn create(&self) -> HsmResult<HsmHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullKey;

    impl KeyHsm for NullKey {
        fn symmetric_key(&self) -> HsmResult<String> {
            Ok("AAAA".into())
        }
        fn registration_name(&self) -> HsmResult<String> {
            Ok("dev".into())
        }
        fn set_key_info(&mut self, _: &str, _: &str) -> HsmResult<()> {
            Ok(())
        }
    }

    struct BareX509;

    impl X509Hsm for BareX509 {
        fn certificate(&self) -> HsmResult<String> {
            Ok(String::new())
        }
        fn alias_key(&self) -> HsmResult<String> {
            Ok(String::new())
        }
        fn common_name(&self) -> HsmResult<String> {
            Ok("cn".into())
        }
    }

    #[test]
    fn test_handle_satisfies_kind() {
        let handle = HsmHandle::SymmetricKey(Box::new(NullKey));
        assert!(handle.satisfies(BackendKind::SymmetricKey));
        assert!(!handle.satisfies(BackendKind::Tpm));

        let handle = HsmHandle::X509(Box::new(BareX509));
        assert!(handle.satisfies(BackendKind::X509Static));
        assert!(handle.satisfies(BackendKind::X509Riot));
        assert!(!handle.satisfies(BackendKind::HttpEdge));
    }

    #[test]
    fn test_default_extras_are_unsupported() {
        let backend = BareX509;
        assert!(matches!(backend.root_cert(), Err(HsmError::ProtocolSequence(_))));
        assert!(matches!(
            backend.create_leaf_cert("verification"),
            Err(HsmError::ProtocolSequence(_))
        ));
    }

    #[test]
    fn test_kind_from_device_type() {
        assert_eq!(BackendKind::from_device_type(DeviceType::Riot), BackendKind::X509Riot);
        assert_eq!(BackendKind::from_device_type(DeviceType::X509), BackendKind::X509Static);
        assert!(BackendKind::X509Riot.is_x509());
        assert!(!BackendKind::Tpm.is_x509());
    }
}
