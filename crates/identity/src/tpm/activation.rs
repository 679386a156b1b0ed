//! Activation blob issued by the provisioning service.
//!
//! Wire layout, all sizes big-endian `u16`:
//!
//! ```text
//! TPM2B_ID_OBJECT         credential blob for ActivateCredential
//! TPM2B_ENCRYPTED_SECRET  seed encrypted to the EK
//! TPM2B_PRIVATE           duplicated identity key
//! TPM2B_ENCRYPTED_SECRET  symmetric seed for Import
//! TPM2B_PUBLIC            identity key public area (NULL nameAlg allowed)
//! u16 + bytes             encrypted payload
//! ```

use super::marshal::{Cursor, Tpm2bPublic, Writer};
use crate::error::{HsmError, HsmResult};
use tracing::debug;

/// Parsed view over an activation blob. Byte fields borrow from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationBlob<'a> {
    pub id_object: &'a [u8],
    pub encrypted_secret: &'a [u8],
    pub duplicate: &'a [u8],
    pub encrypted_wrap_key: &'a [u8],
    pub public: Tpm2bPublic,
    pub encrypted_payload: &'a [u8],
}

impl<'a> ActivationBlob<'a> {
    /// Parse every field in order. Any field that claims more bytes than
    /// remain fails the whole parse.
    pub fn parse(bytes: &'a [u8]) -> HsmResult<Self> {
        if bytes.is_empty() {
            return Err(HsmError::InvalidArgument("activation blob is empty".into()));
        }
        let mut cursor = Cursor::new(bytes);

        let id_object = read_field(&mut cursor, "TPM2B_ID_OBJECT")?;
        let encrypted_secret = read_field(&mut cursor, "TPM2B_ENCRYPTED_SECRET")?;
        let duplicate = read_field(&mut cursor, "TPM2B_PRIVATE")?;
        let encrypted_wrap_key = read_field(&mut cursor, "TPM2B_ENCRYPTED_SECRET (wrap key)")?;
        let public = Tpm2bPublic::unmarshal(&mut cursor, true)
            .map_err(|e| HsmError::Codec(format!("TPM2B_PUBLIC: {}", e)))?;
        let encrypted_payload = read_field(&mut cursor, "encrypted payload")?;

        if !cursor.is_empty() {
            debug!(
                trailing = cursor.remaining(),
                "ActivationBlob :: ignoring trailing bytes"
            );
        }

        Ok(Self {
            id_object,
            encrypted_secret,
            duplicate,
            encrypted_wrap_key,
            public,
            encrypted_payload,
        })
    }

    /// Encode in the service wire layout.
    pub fn encode(&self) -> HsmResult<Vec<u8>> {
        let mut out = Writer::new();
        out.write_tpm2b(self.id_object)?;
        out.write_tpm2b(self.encrypted_secret)?;
        out.write_tpm2b(self.duplicate)?;
        out.write_tpm2b(self.encrypted_wrap_key)?;
        self.public.marshal(&mut out)?;
        out.write_tpm2b(self.encrypted_payload)?;
        Ok(out.into_bytes())
    }
}

fn read_field<'a>(cursor: &mut Cursor<'a>, name: &str) -> HsmResult<&'a [u8]> {
    cursor
        .read_tpm2b()
        .map_err(|e| HsmError::Codec(format!("{}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::marshal::{
        KeyedHashScheme, ObjectAttributes, PublicParms, PublicUnique, TpmtPublic, TPM_ALG_HMAC,
        TPM_ALG_SHA256,
    };

    fn identity_public() -> Tpm2bPublic {
        Tpm2bPublic::new(TpmtPublic {
            name_alg: TPM_ALG_SHA256,
            object_attributes: ObjectAttributes::new().user_with_auth().sign_encrypt(),
            auth_policy: Vec::new(),
            parameters: PublicParms::KeyedHash {
                scheme: KeyedHashScheme {
                    scheme: TPM_ALG_HMAC,
                    hash_alg: TPM_ALG_SHA256,
                    kdf: 0,
                },
            },
            unique: PublicUnique::KeyedHash(vec![0x5A; 32]),
        })
    }

    fn sample_blob() -> Vec<u8> {
        ActivationBlob {
            id_object: &[1, 2, 3],
            encrypted_secret: &[4, 5],
            duplicate: &[6, 7, 8, 9],
            encrypted_wrap_key: &[10],
            public: identity_public(),
            encrypted_payload: &[0xEE; 16],
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_parse_fields_in_order() {
        let bytes = sample_blob();
        let blob = ActivationBlob::parse(&bytes).unwrap();

        assert_eq!(blob.id_object, &[1, 2, 3]);
        assert_eq!(blob.encrypted_secret, &[4, 5]);
        assert_eq!(blob.duplicate, &[6, 7, 8, 9]);
        assert_eq!(blob.encrypted_wrap_key, &[10]);
        assert_eq!(blob.public, identity_public());
        assert_eq!(blob.encrypted_payload.len(), 16);
    }

    #[test]
    fn test_payload_is_borrowed_in_place() {
        let bytes = sample_blob();
        let blob = ActivationBlob::parse(&bytes).unwrap();

        let tail = &bytes[bytes.len() - 16..];
        assert_eq!(blob.encrypted_payload.as_ptr(), tail.as_ptr());
    }

    #[test]
    fn test_every_truncation_is_rejected() {
        let bytes = sample_blob();
        for len in 1..bytes.len() {
            let result = ActivationBlob::parse(&bytes[..len]);
            assert!(
                matches!(result, Err(HsmError::Codec(_))),
                "truncation at {} accepted",
                len
            );
        }
    }

    #[test]
    fn test_oversized_field_rejected() {
        let mut bytes = sample_blob();
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;

        let err = ActivationBlob::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("TPM2B_ID_OBJECT"));
    }

    #[test]
    fn test_empty_blob_is_invalid_argument() {
        assert!(matches!(
            ActivationBlob::parse(&[]),
            Err(HsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_size_public_rejected() {
        let mut out = Writer::new();
        for field in [&[1u8][..], &[2], &[3], &[4]] {
            out.write_tpm2b(field).unwrap();
        }
        out.write_u16(0);
        out.write_tpm2b(&[9, 9]).unwrap();

        assert!(matches!(
            ActivationBlob::parse(&out.into_bytes()),
            Err(HsmError::Codec(_))
        ));
    }
}
