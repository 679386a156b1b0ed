//! X.509 certificate assembly for the RIoT chain.
//!
//! Certificates are built field by field and signed with deterministic
//! ECDSA P-256 (RFC 6979), so a given key set always yields the same DER.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use der::asn1::{BitString, ObjectIdentifier, OctetString, UtcTime};
use der::oid::AssociatedOid;
use der::pem::LineEnding;
use der::{DateTime, Decode, Encode, EncodePem, Sequence};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use p256::{PublicKey, SecretKey};
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, TbsCertificate, Version};

use crate::error::{HsmError, HsmResult};

/// ecdsa-with-SHA256
pub const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
/// id-sha256
pub const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
/// RIoT composite device identity extension
pub const RIOT_COMPOSITE_DEVICE_ID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.89.3.1");

/// Organization and country of every RIoT name
const ORGANIZATION: &str = "MSR_TEST";
const COUNTRY: &str = "US";

/// Firmware measurement carried in the composite device identity.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct FirmwareId {
    pub hash_algorithm: ObjectIdentifier,
    pub digest: OctetString,
}

/// Payload of the composite device identity extension.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CompositeDeviceId {
    pub version: u8,
    pub device_id: SubjectPublicKeyInfoOwned,
    pub fwid: FirmwareId,
}

/// Fields that vary between the certificates of the chain.
pub struct CertProfile<'a> {
    pub serial: &'a [u8],
    pub issuer_cn: &'a str,
    pub subject_cn: &'a str,
    pub validity: Validity,
    pub subject_key: &'a PublicKey,
    pub extensions: Vec<Extension>,
}

fn cert_error(context: &str) -> impl Fn(der::Error) -> HsmError + '_ {
    move |e| HsmError::Certificate(format!("{}: {}", context, e))
}

/// `CN=<cn>,O=MSR_TEST,C=US`
pub fn distinguished_name(common_name: &str) -> HsmResult<Name> {
    if common_name.is_empty() {
        return Err(HsmError::InvalidArgument("common name is empty".into()));
    }
    if common_name
        .chars()
        .any(|c| matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') || c.is_control())
    {
        return Err(HsmError::InvalidArgument(format!(
            "common name {:?} contains reserved characters",
            common_name
        )));
    }
    Name::from_str(&format!("CN={},O={},C={}", common_name, ORGANIZATION, COUNTRY))
        .map_err(cert_error("name"))
}

/// 2017-01-01 00:00:00 to 2037-01-01 00:00:00 UTC.
pub fn fixed_validity() -> HsmResult<Validity> {
    let utc = |year| {
        DateTime::new(year, 1, 1, 0, 0, 0)
            .and_then(UtcTime::from_date_time)
            .map(Time::UtcTime)
            .map_err(cert_error("validity"))
    };
    Ok(Validity {
        not_before: utc(2017)?,
        not_after: utc(2037)?,
    })
}

/// Now until `days` from now.
pub fn validity_from_now(days: u32) -> HsmResult<Validity> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HsmError::Certificate(format!("system clock before epoch: {}", e)))?;
    let now = Duration::from_secs(now.as_secs());
    let until = now + Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    Ok(Validity {
        not_before: Time::UtcTime(UtcTime::from_unix_duration(now).map_err(cert_error("validity"))?),
        not_after: Time::UtcTime(
            UtcTime::from_unix_duration(until).map_err(cert_error("validity"))?,
        ),
    })
}

pub fn subject_public_key_info(key: &PublicKey) -> HsmResult<SubjectPublicKeyInfoOwned> {
    let document = key
        .to_public_key_der()
        .map_err(|e| HsmError::Certificate(format!("public key encoding: {}", e)))?;
    SubjectPublicKeyInfoOwned::from_der(document.as_bytes()).map_err(cert_error("public key"))
}

/// Critical BasicConstraints with the CA flag set.
pub fn basic_constraints_ca() -> HsmResult<Extension> {
    let value = BasicConstraints {
        ca: true,
        path_len_constraint: None,
    }
    .to_der()
    .map_err(cert_error("basic constraints"))?;
    Ok(Extension {
        extn_id: BasicConstraints::OID,
        critical: true,
        extn_value: OctetString::new(value).map_err(cert_error("basic constraints"))?,
    })
}

/// Composite device identity binding the DeviceID key to the firmware id.
pub fn composite_device_id(device_id: &PublicKey, fwid: &[u8]) -> HsmResult<Extension> {
    let value = CompositeDeviceId {
        version: 1,
        device_id: subject_public_key_info(device_id)?,
        fwid: FirmwareId {
            hash_algorithm: ID_SHA256,
            digest: OctetString::new(fwid).map_err(cert_error("firmware id"))?,
        },
    }
    .to_der()
    .map_err(cert_error("composite device id"))?;
    Ok(Extension {
        extn_id: RIOT_COMPOSITE_DEVICE_ID,
        critical: false,
        extn_value: OctetString::new(value).map_err(cert_error("composite device id"))?,
    })
}

/// Build the TBS region from `profile` and sign it with `signer`.
pub fn build_certificate(profile: CertProfile<'_>, signer: &SecretKey) -> HsmResult<Certificate> {
    let algorithm = AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA256,
        parameters: None,
    };
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(profile.serial).map_err(cert_error("serial"))?,
        signature: algorithm.clone(),
        issuer: distinguished_name(profile.issuer_cn)?,
        validity: profile.validity,
        subject: distinguished_name(profile.subject_cn)?,
        subject_public_key_info: subject_public_key_info(profile.subject_key)?,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: if profile.extensions.is_empty() {
            None
        } else {
            Some(profile.extensions)
        },
    };

    let tbs = tbs_certificate.to_der().map_err(cert_error("TBS encoding"))?;
    let signing_key = SigningKey::from(signer);
    let signature: Signature = signing_key
        .try_sign(&tbs)
        .map_err(|e| HsmError::Signing(format!("certificate signature: {}", e)))?;
    let signature = BitString::from_bytes(signature.to_der().as_bytes())
        .map_err(cert_error("signature encoding"))?;

    Ok(Certificate {
        tbs_certificate,
        signature_algorithm: algorithm,
        signature,
    })
}

/// PEM with a trailing newline, so chains concatenate cleanly.
pub fn to_pem(certificate: &Certificate) -> HsmResult<String> {
    let mut pem = certificate
        .to_pem(LineEnding::LF)
        .map_err(cert_error("PEM encoding"))?;
    if !pem.ends_with('\n') {
        pem.push('\n');
    }
    Ok(pem)
}
