//! Trusted Platform Module (TPM) provisioning engine.
//!
//! Drives the credential-activation flow of the provisioning service against
//! a single TPM: persistent EK/SRK bring-up, identity key import, and HMAC
//! signing with the imported key. Each operation is self-contained; no
//! session outlives the call that opened it.

pub mod activation;
pub mod device;
#[cfg(feature = "hardware-tpm")]
pub mod esapi;
pub mod marshal;
pub mod software;
pub mod templates;

use tracing::{error, info, warn};

use crate::backend::TpmHsm;
use crate::error::{HsmError, HsmResult, TpmStep};
use activation::ActivationBlob;
pub use device::{
    Hierarchy, ObjectHandle, SessionHandle, TpmDevice, IDENTITY_KEY_HANDLE, TPM_20_EK_HANDLE,
    TPM_20_SRK_HANDLE,
};
use marshal::{SymDefObject, Tpm2bPublic};
pub use software::SoftwareTpm;

/// TPM-backed HSM client.
pub struct TpmProvisioner {
    device: Box<dyn TpmDevice>,
    ek_public: Tpm2bPublic,
    srk_public: Tpm2bPublic,
}

impl TpmProvisioner {
    /// Bring up the EK and SRK, reusing keys already persisted at their
    /// well-known handles.
    pub fn create(mut device: Box<dyn TpmDevice>) -> HsmResult<Self> {
        let ek_public = ensure_persistent(
            device.as_mut(),
            ObjectHandle(TPM_20_EK_HANDLE),
            Hierarchy::Endorsement,
            &templates::ek_template(),
        )?;
        let srk_public = ensure_persistent(
            device.as_mut(),
            ObjectHandle(TPM_20_SRK_HANDLE),
            Hierarchy::Owner,
            &templates::srk_template(),
        )?;
        info!("STATUS: TpmProvisioner :: EK/SRK :: READY");
        Ok(Self {
            device,
            ek_public,
            srk_public,
        })
    }

    /// Marshaled endorsement key public area.
    pub fn endorsement_key(&self) -> HsmResult<Vec<u8>> {
        marshal_initialized(&self.ek_public, "endorsement key")
    }

    /// Marshaled storage root key public area.
    pub fn storage_key(&self) -> HsmResult<Vec<u8>> {
        marshal_initialized(&self.srk_public, "storage root key")
    }

    /// Activate the service credential and persist the delivered identity key.
    ///
    /// The blob is parsed completely before the first TPM command, so a
    /// malformed blob leaves the TPM untouched.
    pub fn import_key(&mut self, blob: &[u8]) -> HsmResult<()> {
        let blob = ActivationBlob::parse(blob).map_err(|e| {
            error!("ImportKey :: Activation blob REJECTED :: {}", e);
            e
        })?;

        let max_input = self.device.input_buffer_size()?;
        if blob.encrypted_payload.len() > max_input as usize {
            return Err(HsmError::Codec(format!(
                "encrypted payload of {} bytes exceeds TPM input buffer of {}",
                blob.encrypted_payload.len(),
                max_input
            )));
        }

        let inner_wrap_key = self.activate(&blob)?;

        let private = self.device.import(
            ObjectHandle(TPM_20_SRK_HANDLE),
            &inner_wrap_key,
            &blob.public,
            blob.duplicate,
            blob.encrypted_wrap_key,
            SymDefObject::AES_128_CFB,
        )?;

        let loaded = self.device.load(
            ObjectHandle(TPM_20_SRK_HANDLE),
            &private,
            &blob.public,
        )?;

        let identity = ObjectHandle(IDENTITY_KEY_HANDLE);
        if self.device.evict_control(identity, identity).is_ok() {
            info!("ImportKey :: Previous identity key EVICTED");
        }
        let persisted = self.device.evict_control(loaded, identity);
        let flushed = self.device.flush_context(loaded.0);
        persisted?;
        flushed.map_err(|e| {
            error!("ImportKey :: FlushContext of loaded key :: FAILED :: {}", e);
            e
        })?;

        info!(
            "STATUS: TpmProvisioner :: Identity key persisted at 0x{:08x}",
            IDENTITY_KEY_HANDLE
        );
        Ok(())
    }

    /// HMAC `data` with the persisted identity key.
    pub fn sign_data(&mut self, data: &[u8]) -> HsmResult<Vec<u8>> {
        if data.is_empty() {
            return Err(HsmError::InvalidArgument("data to sign is empty".into()));
        }
        let signature = self
            .device
            .hmac(ObjectHandle(IDENTITY_KEY_HANDLE), data)?;
        if signature.is_empty() {
            return Err(HsmError::device(TpmStep::Hmac, "empty signature"));
        }
        Ok(signature)
    }

    fn activate(&mut self, blob: &ActivationBlob<'_>) -> HsmResult<Vec<u8>> {
        let session = self.device.start_policy_session()?;
        if let Err(e) = self.device.policy_secret(session, Hierarchy::Endorsement) {
            let _ = self.device.flush_context(session.0);
            return Err(e);
        }
        self.device
            .activate_credential(
                ObjectHandle(TPM_20_SRK_HANDLE),
                ObjectHandle(TPM_20_EK_HANDLE),
                session,
                blob.id_object,
                blob.encrypted_secret,
            )
            .map_err(|e| {
                error!("ImportKey :: ActivateCredential :: FAILED :: {}", e);
                e
            })
    }
}

impl TpmHsm for TpmProvisioner {
    fn endorsement_key(&self) -> HsmResult<Vec<u8>> {
        TpmProvisioner::endorsement_key(self)
    }

    fn storage_key(&self) -> HsmResult<Vec<u8>> {
        TpmProvisioner::storage_key(self)
    }

    fn import_key(&mut self, blob: &[u8]) -> HsmResult<()> {
        TpmProvisioner::import_key(self, blob)
    }

    fn sign_data(&mut self, data: &[u8]) -> HsmResult<Vec<u8>> {
        TpmProvisioner::sign_data(self, data)
    }
}

impl std::fmt::Debug for TpmProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmProvisioner")
            .field("ek_public", &self.ek_public)
            .field("srk_public", &self.srk_public)
            .finish_non_exhaustive()
    }
}

fn ensure_persistent(
    device: &mut dyn TpmDevice,
    handle: ObjectHandle,
    hierarchy: Hierarchy,
    template: &Tpm2bPublic,
) -> HsmResult<Tpm2bPublic> {
    if let Ok(public) = device.read_public(handle) {
        info!("TpmProvisioner :: Reusing persistent key at 0x{:08x}", handle.0);
        return Ok(public);
    }

    let (transient, public) = device.create_primary(hierarchy, template)?;
    let persisted = device.evict_control(transient, handle);
    let flushed = device.flush_context(transient.0);
    persisted?;
    flushed?;
    info!("TpmProvisioner :: Created persistent key at 0x{:08x}", handle.0);
    Ok(public)
}

fn marshal_initialized(public: &Tpm2bPublic, what: &str) -> HsmResult<Vec<u8>> {
    if public.public_area.unique.is_empty() {
        return Err(HsmError::InvalidState(format!("{} is not initialized", what)));
    }
    public.to_bytes()
}

/// Open the TPM selected by configuration.
///
/// Falls back to a handle on `stub` when hardware is not requested or no
/// device node is present. Stub handles share state, so every context of a
/// process sees the same EK, SRK and identity key.
pub fn open_device(
    config: &devauth_core::TpmConfig,
    stub: &SoftwareTpm,
) -> HsmResult<Box<dyn TpmDevice>> {
    if config.use_hardware && detect_hardware() {
        return open_hardware(config);
    }
    if config.use_hardware {
        warn!("STATUS: TpmProvisioner :: Hardware TPM :: NOT FOUND :: using software TPM");
    }
    Ok(Box::new(stub.clone()))
}

#[cfg(feature = "hardware-tpm")]
fn detect_hardware() -> bool {
    std::path::Path::new("/dev/tpm0").exists() || std::path::Path::new("/dev/tpmrm0").exists()
}

#[cfg(not(feature = "hardware-tpm"))]
fn detect_hardware() -> bool {
    false
}

#[cfg(feature = "hardware-tpm")]
fn open_hardware(config: &devauth_core::TpmConfig) -> HsmResult<Box<dyn TpmDevice>> {
    info!("STATUS: TpmProvisioner :: Hardware Root of Trust :: ACTIVE");
    Ok(Box::new(esapi::EsapiTpm::open(config.tcti.as_deref())?))
}

#[cfg(not(feature = "hardware-tpm"))]
fn open_hardware(_config: &devauth_core::TpmConfig) -> HsmResult<Box<dyn TpmDevice>> {
    Err(HsmError::device(TpmStep::Open, "hardware TPM support disabled"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::marshal::{
        KeyedHashScheme, ObjectAttributes, PublicParms, PublicUnique, TpmtPublic, TPM_ALG_HMAC,
        TPM_ALG_SHA256,
    };
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const DEVICE_KEY: [u8; 32] = [0x24; 32];

    fn identity_public() -> Tpm2bPublic {
        Tpm2bPublic::new(TpmtPublic {
            name_alg: TPM_ALG_SHA256,
            object_attributes: ObjectAttributes::new()
                .fixed_tpm()
                .fixed_parent()
                .user_with_auth()
                .no_da()
                .sign_encrypt(),
            auth_policy: Vec::new(),
            parameters: PublicParms::KeyedHash {
                scheme: KeyedHashScheme {
                    scheme: TPM_ALG_HMAC,
                    hash_alg: TPM_ALG_SHA256,
                    kdf: 0,
                },
            },
            unique: PublicUnique::KeyedHash(vec![0x33; 32]),
        })
    }

    fn activation_blob(provisioner: &TpmProvisioner, payload: &[u8]) -> Vec<u8> {
        let wrap_key = [0x77u8; 16];
        let (id_object, secret) =
            SoftwareTpm::make_credential(&provisioner.ek_public, &wrap_key, b"service-seed")
                .unwrap();
        let duplicate = SoftwareTpm::duplicate(&DEVICE_KEY, &wrap_key).unwrap();
        ActivationBlob {
            id_object: &id_object,
            encrypted_secret: &secret,
            duplicate: &duplicate,
            encrypted_wrap_key: &[0x01; 16],
            public: identity_public(),
            encrypted_payload: payload,
        }
        .encode()
        .unwrap()
    }

    fn provisioner(tpm: &SoftwareTpm) -> TpmProvisioner {
        TpmProvisioner::create(Box::new(tpm.clone())).unwrap()
    }

    #[test]
    fn test_create_persists_ek_and_srk() {
        let tpm = SoftwareTpm::with_seed([9; 32]);
        let _provisioner = provisioner(&tpm);

        assert!(tpm.has_persistent(TPM_20_EK_HANDLE));
        assert!(tpm.has_persistent(TPM_20_SRK_HANDLE));
        assert_eq!(tpm.transient_count(), 0);
    }

    #[test]
    fn test_create_reuses_existing_keys() {
        let tpm = SoftwareTpm::with_seed([9; 32]).with_recorder();
        let first = provisioner(&tpm).endorsement_key().unwrap();
        let before = tpm.command_log().len();

        let second = provisioner(&tpm).endorsement_key().unwrap();
        let issued = &tpm.command_log()[before..];

        assert_eq!(first, second);
        assert_eq!(issued, &[TpmStep::ReadPublic, TpmStep::ReadPublic]);
    }

    #[test]
    fn test_endorsement_and_storage_keys_differ() {
        let tpm = SoftwareTpm::with_seed([10; 32]);
        let provisioner = provisioner(&tpm);

        let ek = provisioner.endorsement_key().unwrap();
        let srk = provisioner.storage_key().unwrap();
        assert_ne!(ek, srk);
        assert_eq!(Tpm2bPublic::from_bytes(&ek, false).unwrap(), provisioner.ek_public);
    }

    #[test]
    fn test_import_then_sign() {
        let tpm = SoftwareTpm::with_seed([11; 32]);
        let mut provisioner = provisioner(&tpm);
        let blob = activation_blob(&provisioner, &[0xAB; 48]);

        provisioner.import_key(&blob).unwrap();
        assert!(tpm.has_persistent(IDENTITY_KEY_HANDLE));
        assert_eq!(tpm.transient_count(), 0);

        let signature = provisioner.sign_data(b"scope\n1700000000").unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(&DEVICE_KEY).unwrap();
        mac.update(b"scope\n1700000000");
        assert_eq!(signature, mac.finalize().into_bytes().to_vec());
    }

    #[test]
    fn test_reimport_replaces_identity_key() {
        let tpm = SoftwareTpm::with_seed([12; 32]);
        let mut provisioner = provisioner(&tpm);
        let blob = activation_blob(&provisioner, &[]);

        provisioner.import_key(&blob).unwrap();
        provisioner.import_key(&blob).unwrap();
        assert!(provisioner.sign_data(b"data").is_ok());
    }

    #[test]
    fn test_failed_flush_aborts_import() {
        let tpm = SoftwareTpm::with_seed([18; 32]);
        let mut provisioner = provisioner(&tpm);
        let blob = activation_blob(&provisioner, &[]);

        tpm.fail_next(TpmStep::FlushContext);
        let err = provisioner.import_key(&blob).unwrap_err();

        assert!(matches!(
            err,
            HsmError::Device {
                step: TpmStep::FlushContext,
                ..
            }
        ));
        provisioner.import_key(&blob).unwrap();
        assert!(provisioner.sign_data(b"data").is_ok());
    }

    #[test]
    fn test_truncated_blob_issues_no_commands() {
        let tpm = SoftwareTpm::with_seed([13; 32]).with_recorder();
        let mut provisioner = provisioner(&tpm);
        let blob = activation_blob(&provisioner, &[0xAB; 8]);
        let before = tpm.command_log().len();

        let err = provisioner.import_key(&blob[..blob.len() - 3]).unwrap_err();

        assert!(matches!(err, HsmError::Codec(_)));
        assert_eq!(tpm.command_log().len(), before);
    }

    #[test]
    fn test_empty_blob_fails() {
        let tpm = SoftwareTpm::with_seed([14; 32]);
        let mut provisioner = provisioner(&tpm);

        let err = provisioner.import_key(&[]).unwrap_err();
        assert_ne!(err.code(), 0);
        assert!(!tpm.has_persistent(IDENTITY_KEY_HANDLE));
    }

    #[test]
    fn test_payload_bounded_by_input_buffer() {
        let tpm = SoftwareTpm::with_seed([15; 32])
            .with_input_buffer(16)
            .with_recorder();
        let mut provisioner = provisioner(&tpm);
        let blob = activation_blob(&provisioner, &[0xCD; 17]);

        assert!(matches!(provisioner.import_key(&blob), Err(HsmError::Codec(_))));
        assert!(!tpm.command_log().contains(&TpmStep::ActivateCredential));
    }

    #[test]
    fn test_blob_for_other_tpm_fails_activation() {
        let other = provisioner(&SoftwareTpm::with_seed([16; 32]));
        let blob = activation_blob(&other, &[]);

        let tpm = SoftwareTpm::with_seed([17; 32]);
        let mut provisioner = provisioner(&tpm);
        let err = provisioner.import_key(&blob).unwrap_err();

        assert!(matches!(
            err,
            HsmError::Device {
                step: TpmStep::ActivateCredential,
                ..
            }
        ));
        assert!(!tpm.has_persistent(IDENTITY_KEY_HANDLE));
    }

    #[test]
    fn test_sign_without_identity_key_fails() {
        let tpm = SoftwareTpm::with_seed([18; 32]);
        let mut provisioner = provisioner(&tpm);

        assert!(matches!(
            provisioner.sign_data(b"payload"),
            Err(HsmError::Device { step: TpmStep::Hmac, .. })
        ));
        assert!(matches!(
            provisioner.sign_data(b""),
            Err(HsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_uninitialized_public_is_rejected() {
        let mut public = templates::ek_template();
        public.public_area.unique = PublicUnique::Rsa(Vec::new());

        assert!(matches!(
            marshal_initialized(&public, "endorsement key"),
            Err(HsmError::InvalidState(_))
        ));
    }

    #[test]
    fn test_open_device_falls_back_to_stub() {
        let config = devauth_core::TpmConfig {
            use_hardware: false,
            tcti: None,
        };
        let stub = SoftwareTpm::with_seed([19; 32]);
        let device = open_device(&config, &stub).unwrap();

        TpmProvisioner::create(device).unwrap();
        assert!(stub.has_persistent(TPM_20_EK_HANDLE));
    }
}
