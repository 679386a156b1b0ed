//! IoT hub credential facade.
//!
//! Produces the credential a hub connection presents: a SAS token signed by
//! the TPM, edge runtime or symmetric key, or the X.509 certificate and key.

use tracing::{error, info};

use crate::backend::{BackendKind, HsmHandle};
use crate::error::{HsmError, HsmResult};
use crate::sas;
use crate::system::{HsmSystem, IotHubSecurityType};

/// How the hub connection authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubAuthType {
    Sas,
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Sas,
    X509,
    SymmetricKey,
}

/// Parameters for [`HubAuth::generate_credentials`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub kind: CredentialKind,
    /// Resource URI the SAS token grants access to
    pub scope: String,
    /// Token expiry in Unix seconds
    pub expiry: u64,
    pub key_name: Option<String>,
}

impl CredentialRequest {
    pub fn sas(scope: impl Into<String>, expiry: u64) -> Self {
        Self {
            kind: CredentialKind::Sas,
            scope: scope.into(),
            expiry,
            key_name: None,
        }
    }

    pub fn x509() -> Self {
        Self {
            kind: CredentialKind::X509,
            scope: String::new(),
            expiry: 0,
            key_name: None,
        }
    }

    pub fn symmetric_key() -> Self {
        Self {
            kind: CredentialKind::SymmetricKey,
            ..Self::x509()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialResult {
    SasToken(String),
    X509 {
        certificate: String,
        private_key: String,
    },
    SymmetricKey {
        registration_id: String,
        key: String,
    },
}

/// Credential source for one hub connection.
pub struct HubAuth {
    handle: HsmHandle,
    auth_type: HubAuthType,
}

impl HubAuth {
    /// Open a context for `security_type`, which must suit the configured
    /// device.
    pub fn create(system: &HsmSystem, security_type: IotHubSecurityType) -> HsmResult<Self> {
        system.ensure_hub_security(security_type)?;
        let auth_type = match system.kind() {
            BackendKind::X509Static | BackendKind::X509Riot => HubAuthType::X509,
            BackendKind::Tpm | BackendKind::SymmetricKey | BackendKind::HttpEdge => {
                HubAuthType::Sas
            }
        };
        let handle = system.create_handle()?;
        info!("HubAuth :: {:?} context :: CREATED", security_type);
        Ok(Self { handle, auth_type })
    }

    pub fn auth_type(&self) -> HubAuthType {
        self.auth_type
    }

    pub fn generate_credentials(
        &mut self,
        request: &CredentialRequest,
    ) -> HsmResult<CredentialResult> {
        match (request.kind, &mut self.handle) {
            (CredentialKind::Sas, HsmHandle::Tpm(tpm)) => {
                let payload = sas::signing_payload(&request.scope, request.expiry)?;
                let signature = tpm.sign_data(payload.as_bytes())?;
                sas_result(request, &signature)
            }
            (CredentialKind::Sas, HsmHandle::HttpEdge(edge)) => {
                let payload = sas::signing_payload(&request.scope, request.expiry)?;
                let signature = edge.sign_data(payload.as_bytes())?;
                sas_result(request, &signature)
            }
            (CredentialKind::Sas, HsmHandle::SymmetricKey(key)) => {
                let payload = sas::signing_payload(&request.scope, request.expiry)?;
                let signature =
                    sas::hmac_with_encoded_key(&key.symmetric_key()?, payload.as_bytes())?;
                sas_result(request, &signature)
            }
            (CredentialKind::X509, HsmHandle::X509(x509)) => Ok(CredentialResult::X509 {
                certificate: x509.certificate()?,
                private_key: x509.alias_key()?,
            }),
            (CredentialKind::SymmetricKey, HsmHandle::SymmetricKey(key)) => {
                Ok(CredentialResult::SymmetricKey {
                    registration_id: key.registration_name()?,
                    key: key.symmetric_key()?,
                })
            }
            (kind, handle) => {
                error!(
                    "HubAuth :: {:?} credentials from {} backend :: REJECTED",
                    kind,
                    handle.capability_name()
                );
                Err(HsmError::ProtocolSequence(format!(
                    "{:?} credentials cannot be generated by the {} backend",
                    kind,
                    handle.capability_name()
                )))
            }
        }
    }

    /// Trust bundle of the edge runtime.
    pub fn trust_bundle(&mut self) -> HsmResult<String> {
        match &mut self.handle {
            HsmHandle::HttpEdge(edge) => edge.trust_bundle(),
            other => Err(HsmError::ProtocolSequence(format!(
                "trust bundle is not available from the {} backend",
                other.capability_name()
            ))),
        }
    }

    /// Release the backend context.
    pub fn destroy(self) {
        info!("HubAuth :: {:?} context :: DESTROYED", self.auth_type);
    }
}

impl std::fmt::Debug for HubAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubAuth")
            .field("auth_type", &self.auth_type)
            .field("handle", &self.handle)
            .finish()
    }
}

fn sas_result(request: &CredentialRequest, signature: &[u8]) -> HsmResult<CredentialResult> {
    sas::format_token(
        &request.scope,
        signature,
        request.expiry,
        request.key_name.as_deref(),
    )
    .map(CredentialResult::SasToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{RiotFactory, SymmetricKeyFactory};
    use devauth_core::{RiotConfig, SymmetricKeyConfig};

    fn key_system() -> HsmSystem {
        HsmSystem::new(Box::new(SymmetricKeyFactory::new(SymmetricKeyConfig {
            registration_id: Some("dev1".into()),
            key: Some("AAAA".into()),
        })))
    }

    #[test]
    fn test_incompatible_security_type() {
        let system = key_system();
        assert!(matches!(
            HubAuth::create(&system, IotHubSecurityType::Sas),
            Err(HsmError::ProtocolSequence(_))
        ));
    }

    #[test]
    fn test_symmetric_credentials() {
        let system = key_system();
        let mut auth = HubAuth::create(&system, IotHubSecurityType::SymmetricKey).unwrap();
        assert_eq!(auth.auth_type(), HubAuthType::Sas);

        let pair = auth
            .generate_credentials(&CredentialRequest::symmetric_key())
            .unwrap();
        assert_eq!(
            pair,
            CredentialResult::SymmetricKey {
                registration_id: "dev1".into(),
                key: "AAAA".into(),
            }
        );

        let mut request = CredentialRequest::sas("hub/devices/dev1", 1_700_000_000);
        request.key_name = Some("device".into());
        let token = auth.generate_credentials(&request).unwrap();
        assert!(matches!(
            token,
            CredentialResult::SasToken(ref t) if t.starts_with("SharedAccessSignature sr=hub/devices/dev1&sig=") && t.ends_with("&se=1700000000&skn=device")
        ));
    }

    #[test]
    fn test_x509_credentials() {
        let system = HsmSystem::new(Box::new(RiotFactory::new(RiotConfig::default())));
        let mut auth = HubAuth::create(&system, IotHubSecurityType::X509).unwrap();
        assert_eq!(auth.auth_type(), HubAuthType::X509);

        let credentials = auth.generate_credentials(&CredentialRequest::x509()).unwrap();
        let CredentialResult::X509 {
            certificate,
            private_key,
        } = credentials
        else {
            panic!("expected X.509 credentials");
        };
        assert_eq!(certificate.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(private_key.contains("EC PRIVATE KEY"));

        assert!(matches!(
            auth.generate_credentials(&CredentialRequest::sas("scope", 1)),
            Err(HsmError::ProtocolSequence(_))
        ));
        assert!(matches!(auth.trust_bundle(), Err(HsmError::ProtocolSequence(_))));
    }
}
