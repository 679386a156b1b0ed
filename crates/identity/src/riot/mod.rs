//! RIoT/DICE identity chain.
//!
//! Derives the DeviceID and Alias key pairs from the device secret and boot
//! measurements, then issues the certificate chain presented for X.509
//! authentication:
//!
//! ```text
//! riot-root ──signs──▶ riot-signer-core (DeviceID) ──signs──▶ alias (common name)
//! ```
//!
//! In self-signed mode the DeviceID certificate is signed by its own key and
//! the root only issues leaf certificates.

pub mod cert;
pub mod kdf;

use der::pem::LineEnding;
use p256::pkcs8::EncodePublicKey;
use p256::SecretKey;
use rand::rngs::OsRng;
use tracing::{debug, info};
use zeroize::Zeroizing;

use devauth_core::{DeviceCertSigning, RiotConfig};

use crate::backend::X509Hsm;
use crate::error::{HsmError, HsmResult};
use cert::CertProfile;

/// Reference unique device secret
pub const DEFAULT_UDS: [u8; 32] = [
    0x54, 0x10, 0x5D, 0x2E, 0xCD, 0x07, 0xF9, 0x01, 0x99, 0xB3, 0x95, 0xC7, 0x42, 0x61, 0xA0, 0x8C,
    0xFF, 0x27, 0x1A, 0x0D, 0xF6, 0x6F, 0x1F, 0xE0, 0x00, 0x34, 0xBB, 0x11, 0xF7, 0x98, 0x9A, 0x12,
];

/// Reference RIoT core measurement
pub const DEFAULT_MEASUREMENT: [u8; 32] = [
    0xb5, 0x85, 0x94, 0x93, 0x66, 0x1e, 0x2e, 0xae, 0x96, 0x77, 0xc5, 0x5d, 0x59, 0x0b, 0x92, 0x94,
    0xe0, 0x94, 0xab, 0xaf, 0xd7, 0x40, 0x78, 0x7e, 0x05, 0x0d, 0xfe, 0x6d, 0x85, 0x90, 0x53, 0xa0,
];

/// Reference firmware id
pub const DEFAULT_FIRMWARE_ID: [u8; 32] = [
    0x6B, 0xE9, 0xB1, 0x84, 0xC9, 0x37, 0xC2, 0x8E, 0x12, 0x2E, 0xEE, 0x51, 0x2B, 0x68, 0xEA, 0x8E,
    0x00, 0xC3, 0xDD, 0x15, 0x9E, 0xA4, 0xE8, 0x5E, 0x84, 0xCB, 0xA9, 0x66, 0xF4, 0x46, 0xCD, 0x4E,
];

pub const SIGNER_COMMON_NAME: &str = "riot-signer-core";
pub const ROOT_COMMON_NAME: &str = "riot-root";

const ALIAS_SERIAL: [u8; 5] = [0x0A, 0x0B, 0x0C, 0x0D, 0x0E];
const DEVICE_SERIAL: [u8; 5] = [0x0E, 0x0D, 0x0C, 0x0B, 0x0A];
const ROOT_SERIAL: [u8; 5] = [0x1A, 0x2B, 0x3C, 0x4D, 0x5E];
const LEAF_SERIAL: [u8; 5] = [0x5E, 0x4D, 0x3C, 0x2B, 0x1A];

/// Derived RIoT identity with its issued certificates.
pub struct RiotIdentity {
    device_id: SecretKey,
    alias_key: SecretKey,
    root_key: SecretKey,
    alias_cert: String,
    device_cert: String,
    root_cert: String,
    common_name: String,
    leaf_validity_days: u32,
}

impl RiotIdentity {
    /// Derive the chain under a freshly generated root key.
    pub fn create(config: &RiotConfig) -> HsmResult<Self> {
        Self::with_root_key(config, SecretKey::random(&mut OsRng))
    }

    /// Derive the chain, counter-signing with `root_key`.
    pub fn with_root_key(config: &RiotConfig, root_key: SecretKey) -> HsmResult<Self> {
        if config.common_name.is_empty() {
            return Err(HsmError::InvalidArgument(
                "RIoT alias common name is empty".into(),
            ));
        }
        let uds = seed_input(config.uds.as_deref(), &DEFAULT_UDS, "uds")?;
        let measurement =
            seed_input(config.measurement.as_deref(), &DEFAULT_MEASUREMENT, "measurement")?;
        let fwid = seed_input(config.firmware_id.as_deref(), &DEFAULT_FIRMWARE_ID, "firmware_id")?;

        let uds_digest = kdf::hash(&[uds.as_slice()]);
        let cdi = kdf::hash(&[uds_digest.as_slice(), measurement.as_slice()]);
        let device_id = kdf::derive_ecc_key(cdi.as_slice(), kdf::LABEL_IDENTITY)?;
        let fw_digest = kdf::hash(&[cdi.as_slice(), fwid.as_slice()]);
        let alias_key = kdf::derive_ecc_key(fw_digest.as_slice(), kdf::LABEL_ALIAS)?;
        debug!("RiotIdentity :: DeviceID and Alias keys derived");

        let alias = cert::build_certificate(
            CertProfile {
                serial: &ALIAS_SERIAL,
                issuer_cn: SIGNER_COMMON_NAME,
                subject_cn: &config.common_name,
                validity: cert::fixed_validity()?,
                subject_key: &alias_key.public_key(),
                extensions: vec![cert::composite_device_id(&device_id.public_key(), &fwid)?],
            },
            &device_id,
        )?;

        let (device_issuer, device_signer) = match config.signing {
            DeviceCertSigning::RootSigned => (ROOT_COMMON_NAME, &root_key),
            DeviceCertSigning::SelfSigned => (SIGNER_COMMON_NAME, &device_id),
        };
        let device = cert::build_certificate(
            CertProfile {
                serial: &DEVICE_SERIAL,
                issuer_cn: device_issuer,
                subject_cn: SIGNER_COMMON_NAME,
                validity: cert::fixed_validity()?,
                subject_key: &device_id.public_key(),
                extensions: vec![cert::basic_constraints_ca()?],
            },
            device_signer,
        )?;

        let root = cert::build_certificate(
            CertProfile {
                serial: &ROOT_SERIAL,
                issuer_cn: ROOT_COMMON_NAME,
                subject_cn: ROOT_COMMON_NAME,
                validity: cert::fixed_validity()?,
                subject_key: &root_key.public_key(),
                extensions: vec![cert::basic_constraints_ca()?],
            },
            &root_key,
        )?;

        info!(
            "STATUS: RiotIdentity :: Certificate chain :: READY ({:?})",
            config.signing
        );
        Ok(Self {
            alias_cert: cert::to_pem(&alias)?,
            device_cert: cert::to_pem(&device)?,
            root_cert: cert::to_pem(&root)?,
            device_id,
            alias_key,
            root_key,
            common_name: config.common_name.clone(),
            leaf_validity_days: config.leaf_validity_days,
        })
    }

    /// Alias certificate followed by the DeviceID certificate.
    pub fn certificate(&self) -> String {
        format!("{}{}", self.alias_cert, self.device_cert)
    }

    /// SEC1 PEM of the Alias private key.
    pub fn alias_key(&self) -> HsmResult<String> {
        sec1_pem(&self.alias_key)
    }

    pub fn device_id_public_pem(&self) -> HsmResult<String> {
        self.device_id
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| HsmError::Certificate(format!("DeviceID public key encoding: {}", e)))
    }

    /// DeviceID certificate.
    pub fn signer_cert(&self) -> String {
        self.device_cert.clone()
    }

    pub fn root_cert(&self) -> String {
        self.root_cert.clone()
    }

    /// SEC1 PEM of the root private key.
    pub fn root_key(&self) -> HsmResult<String> {
        sec1_pem(&self.root_key)
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Issue a short-lived certificate for `common_name` bound to the
    /// DeviceID key, signed by the root.
    pub fn create_leaf_cert(&self, common_name: &str) -> HsmResult<String> {
        let leaf = cert::build_certificate(
            CertProfile {
                serial: &LEAF_SERIAL,
                issuer_cn: ROOT_COMMON_NAME,
                subject_cn: common_name,
                validity: cert::validity_from_now(self.leaf_validity_days)?,
                subject_key: &self.device_id.public_key(),
                extensions: Vec::new(),
            },
            &self.root_key,
        )?;
        info!("RiotIdentity :: Leaf certificate issued for {}", common_name);
        cert::to_pem(&leaf)
    }
}

impl X509Hsm for RiotIdentity {
    fn certificate(&self) -> HsmResult<String> {
        Ok(RiotIdentity::certificate(self))
    }

    fn alias_key(&self) -> HsmResult<String> {
        RiotIdentity::alias_key(self)
    }

    fn common_name(&self) -> HsmResult<String> {
        Ok(self.common_name.clone())
    }

    fn signer_cert(&self) -> HsmResult<String> {
        Ok(RiotIdentity::signer_cert(self))
    }

    fn root_cert(&self) -> HsmResult<String> {
        Ok(RiotIdentity::root_cert(self))
    }

    fn root_key(&self) -> HsmResult<String> {
        RiotIdentity::root_key(self)
    }

    fn create_leaf_cert(&self, common_name: &str) -> HsmResult<String> {
        RiotIdentity::create_leaf_cert(self, common_name)
    }
}

impl std::fmt::Debug for RiotIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiotIdentity")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

fn sec1_pem(key: &SecretKey) -> HsmResult<String> {
    let pem = key
        .to_sec1_pem(LineEnding::LF)
        .map_err(|e| HsmError::Certificate(format!("private key encoding: {}", e)))?;
    Ok(pem.as_str().to_owned())
}

/// Hex override from config, or the reference vector.
fn seed_input(
    hex_value: Option<&str>,
    default: &[u8; 32],
    field: &str,
) -> HsmResult<Zeroizing<Vec<u8>>> {
    let Some(hex_value) = hex_value else {
        return Ok(Zeroizing::new(default.to_vec()));
    };
    let bytes = Zeroizing::new(
        hex::decode(hex_value.trim())
            .map_err(|e| HsmError::Config(format!("riot.{} is not hex: {}", field, e)))?,
    );
    if bytes.len() != default.len() {
        return Err(HsmError::Config(format!(
            "riot.{} must be {} bytes, got {}",
            field,
            default.len(),
            bytes.len()
        )));
    }
    Ok(bytes)
}
