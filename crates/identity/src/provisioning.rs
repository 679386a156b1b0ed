//! Provisioning authentication facade.
//!
//! Presents one API over whichever backend the process was configured
//! with. Calls that do not apply to the backend in use fail with
//! [`HsmError::ProtocolSequence`] instead of reaching a backend.

use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::backend::{BackendKind, HsmHandle, KeyHsm, TpmHsm, X509Hsm};
use crate::error::{HsmError, HsmResult};
use crate::sas;
use crate::system::HsmSystem;

/// Credential type presented to the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvAuthType {
    Tpm,
    X509,
    SymmetricKey,
}

/// Registration id of a TPM device: lowercase, unpadded base32 of the
/// SHA-256 of the marshaled endorsement key.
pub fn tpm_registration_id(endorsement_key: &[u8]) -> HsmResult<String> {
    if endorsement_key.is_empty() {
        return Err(HsmError::InvalidArgument("endorsement key is empty".into()));
    }
    let digest = Sha256::digest(endorsement_key);
    Ok(base32::encode(base32::Alphabet::RFC4648 { padding: false }, &digest).to_lowercase())
}

/// Authentication context for device provisioning.
pub struct ProvisioningAuth {
    handle: HsmHandle,
    auth_type: ProvAuthType,
    registration_id: Option<String>,
}

impl ProvisioningAuth {
    pub fn create(system: &HsmSystem) -> HsmResult<Self> {
        let auth_type = match system.kind() {
            BackendKind::Tpm => ProvAuthType::Tpm,
            BackendKind::X509Static | BackendKind::X509Riot => ProvAuthType::X509,
            BackendKind::SymmetricKey => ProvAuthType::SymmetricKey,
            BackendKind::HttpEdge => {
                error!("ProvisioningAuth :: HTTP edge backend :: REJECTED");
                return Err(HsmError::ProtocolSequence(
                    "provisioning does not support the HTTP edge backend".into(),
                ));
            }
        };
        let handle = system.create_handle()?;
        info!("ProvisioningAuth :: {:?} context :: CREATED", auth_type);
        Ok(Self {
            handle,
            auth_type,
            registration_id: None,
        })
    }

    pub fn auth_type(&self) -> ProvAuthType {
        self.auth_type
    }

    fn tpm(&self) -> HsmResult<&dyn TpmHsm> {
        match &self.handle {
            HsmHandle::Tpm(tpm) => Ok(tpm.as_ref()),
            _ => Err(self.wrong_type("TPM")),
        }
    }

    fn tpm_mut(&mut self) -> HsmResult<&mut dyn TpmHsm> {
        match &mut self.handle {
            HsmHandle::Tpm(tpm) => Ok(tpm.as_mut()),
            _ => Err(wrong_type(self.auth_type, "TPM")),
        }
    }

    fn x509(&self) -> HsmResult<&dyn X509Hsm> {
        match &self.handle {
            HsmHandle::X509(x509) => Ok(x509.as_ref()),
            _ => Err(self.wrong_type("X.509")),
        }
    }

    fn key(&self) -> HsmResult<&dyn KeyHsm> {
        match &self.handle {
            HsmHandle::SymmetricKey(key) => Ok(key.as_ref()),
            _ => Err(self.wrong_type("symmetric key")),
        }
    }

    fn key_mut(&mut self) -> HsmResult<&mut dyn KeyHsm> {
        match &mut self.handle {
            HsmHandle::SymmetricKey(key) => Ok(key.as_mut()),
            _ => Err(wrong_type(self.auth_type, "symmetric key")),
        }
    }

    fn wrong_type(&self, required: &str) -> HsmError {
        wrong_type(self.auth_type, required)
    }

    /// Registration id, derived from the backend on first use and cached.
    pub fn registration_id(&mut self) -> HsmResult<String> {
        if let Some(id) = &self.registration_id {
            return Ok(id.clone());
        }
        let id = match &self.handle {
            HsmHandle::Tpm(tpm) => tpm_registration_id(&tpm.endorsement_key()?)?,
            HsmHandle::X509(x509) => x509.common_name()?,
            HsmHandle::SymmetricKey(key) => key.registration_name()?,
            HsmHandle::HttpEdge(_) => return Err(self.wrong_type("provisioning")),
        };
        if id.is_empty() {
            return Err(HsmError::InvalidState("backend returned an empty registration id".into()));
        }
        debug!("ProvisioningAuth :: Registration id {} :: LOADED", id);
        self.registration_id = Some(id.clone());
        Ok(id)
    }

    /// Override the registration id; only allowed before one is known.
    pub fn set_registration_id(&mut self, registration_id: &str) -> HsmResult<()> {
        if registration_id.is_empty() {
            return Err(HsmError::InvalidArgument("registration id is empty".into()));
        }
        if self.registration_id.is_some() {
            error!("ProvisioningAuth :: Registration id already set :: REJECTED");
            return Err(HsmError::ProtocolSequence(
                "registration id has already been set".into(),
            ));
        }
        self.registration_id = Some(registration_id.to_owned());
        Ok(())
    }

    pub fn endorsement_key(&self) -> HsmResult<Vec<u8>> {
        self.tpm()?.endorsement_key()
    }

    pub fn storage_key(&self) -> HsmResult<Vec<u8>> {
        self.tpm()?.storage_key()
    }

    pub fn import_key(&mut self, blob: &[u8]) -> HsmResult<()> {
        self.tpm_mut()?.import_key(blob)
    }

    /// SAS token for `scope` valid until `expiry`, signed by the TPM
    /// identity key or the symmetric key.
    pub fn construct_sas_token(
        &mut self,
        scope: &str,
        key_name: Option<&str>,
        expiry: u64,
    ) -> HsmResult<String> {
        let payload = sas::signing_payload(scope, expiry)?;
        let signature = match &mut self.handle {
            HsmHandle::Tpm(tpm) => tpm.sign_data(payload.as_bytes())?,
            HsmHandle::SymmetricKey(key) => {
                sas::hmac_with_encoded_key(&key.symmetric_key()?, payload.as_bytes())?
            }
            _ => return Err(wrong_type(self.auth_type, "TPM or symmetric key")),
        };
        sas::format_token(scope, &signature, expiry, key_name)
    }

    pub fn certificate(&self) -> HsmResult<String> {
        self.x509()?.certificate()
    }

    pub fn alias_key(&self) -> HsmResult<String> {
        self.x509()?.alias_key()
    }

    pub fn signer_cert(&self) -> HsmResult<String> {
        self.x509()?.signer_cert()
    }

    pub fn root_cert(&self) -> HsmResult<String> {
        self.x509()?.root_cert()
    }

    pub fn root_key(&self) -> HsmResult<String> {
        self.x509()?.root_key()
    }

    pub fn create_leaf_cert(&self, common_name: &str) -> HsmResult<String> {
        self.x509()?.create_leaf_cert(common_name)
    }

    pub fn symmetric_key(&self) -> HsmResult<String> {
        self.key()?.symmetric_key()
    }

    /// Replace the symmetric key pair.
    ///
    /// A registration id already observed on this context is kept; the new
    /// registration name only applies while none is known.
    pub fn set_symmetric_key_info(
        &mut self,
        registration_name: &str,
        symmetric_key: &str,
    ) -> HsmResult<()> {
        self.key_mut()?.set_key_info(registration_name, symmetric_key)?;
        if self.registration_id.is_none() {
            self.registration_id = Some(registration_name.to_owned());
        }
        Ok(())
    }

    /// Release the backend context.
    pub fn destroy(self) {
        info!("ProvisioningAuth :: {:?} context :: DESTROYED", self.auth_type);
    }
}

impl std::fmt::Debug for ProvisioningAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningAuth")
            .field("auth_type", &self.auth_type)
            .field("registration_id", &self.registration_id)
            .finish_non_exhaustive()
    }
}

fn wrong_type(actual: ProvAuthType, required: &str) -> HsmError {
    error!(
        "ProvisioningAuth :: {} operation on {:?} context :: REJECTED",
        required, actual
    );
    HsmError::ProtocolSequence(format!(
        "{} operation invalid for {:?} authentication",
        required, actual
    ))
}
