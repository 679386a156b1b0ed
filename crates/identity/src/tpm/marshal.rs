//! Big-endian TPM 2.0 structure marshaling.
//!
//! Only the structures the provisioning protocol exchanges are covered:
//! sized buffers (TPM2B) and the public area (TPMT_PUBLIC / TPM2B_PUBLIC)
//! for RSA, ECC, keyed-hash and symmetric objects. Reads go through
//! [`Cursor`], which tracks the remaining length and refuses to read past it.

use crate::error::{HsmError, HsmResult};

/// Algorithm identifiers (TPM_ALG_ID)
pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_HMAC: u16 = 0x0005;
pub const TPM_ALG_AES: u16 = 0x0006;
pub const TPM_ALG_KEYEDHASH: u16 = 0x0008;
pub const TPM_ALG_XOR: u16 = 0x000A;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_SHA384: u16 = 0x000C;
pub const TPM_ALG_SHA512: u16 = 0x000D;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_SM3_256: u16 = 0x0012;
pub const TPM_ALG_ECDAA: u16 = 0x001A;
pub const TPM_ALG_ECC: u16 = 0x0023;
pub const TPM_ALG_SYMCIPHER: u16 = 0x0025;
pub const TPM_ALG_CFB: u16 = 0x0043;

/// ECC curve identifiers
pub const TPM_ECC_NIST_P256: u16 = 0x0003;

fn is_hash_alg(alg: u16) -> bool {
    matches!(
        alg,
        TPM_ALG_SHA1 | TPM_ALG_SHA256 | TPM_ALG_SHA384 | TPM_ALG_SHA512 | TPM_ALG_SM3_256
    )
}

/// Bounded reader over a marshaled buffer.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> HsmResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(HsmError::Codec(format!(
                "buffer underflow: {} bytes requested at offset {}, {} remaining",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let data: &'a [u8] = self.data;
        let bytes = &data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> HsmResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> HsmResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> HsmResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a TPM2B (size-prefixed buffer) without copying.
    pub fn read_tpm2b(&mut self) -> HsmResult<&'a [u8]> {
        let size = self.read_u16()? as usize;
        self.read_bytes(size)
    }

    /// Split off the next `len` bytes as an independent cursor.
    pub fn sub_cursor(&mut self, len: usize) -> HsmResult<Cursor<'a>> {
        Ok(Cursor::new(self.read_bytes(len)?))
    }
}

/// Growable big-endian writer.
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, val: u8) -> &mut Self {
        self.data.push(val);
        self
    }

    pub fn write_u16(&mut self, val: u16) -> &mut Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, val: u32) -> &mut Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Write a TPM2B; fails when the payload does not fit a 16-bit size.
    pub fn write_tpm2b(&mut self, bytes: &[u8]) -> HsmResult<&mut Self> {
        let size = u16::try_from(bytes.len())
            .map_err(|_| HsmError::Codec(format!("TPM2B payload too large: {}", bytes.len())))?;
        self.write_u16(size);
        self.write_bytes(bytes);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Object attributes (TPMA_OBJECT)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectAttributes(u32);

impl ObjectAttributes {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn fixed_tpm(mut self) -> Self {
        self.0 |= 1 << 1;
        self
    }

    pub fn fixed_parent(mut self) -> Self {
        self.0 |= 1 << 4;
        self
    }

    pub fn sensitive_data_origin(mut self) -> Self {
        self.0 |= 1 << 5;
        self
    }

    pub fn user_with_auth(mut self) -> Self {
        self.0 |= 1 << 6;
        self
    }

    pub fn admin_with_policy(mut self) -> Self {
        self.0 |= 1 << 7;
        self
    }

    pub fn no_da(mut self) -> Self {
        self.0 |= 1 << 10;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.0 |= 1 << 16;
        self
    }

    pub fn decrypt(mut self) -> Self {
        self.0 |= 1 << 17;
        self
    }

    pub fn sign_encrypt(mut self) -> Self {
        self.0 |= 1 << 18;
        self
    }

    pub fn contains(&self, other: ObjectAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Symmetric definition for objects (TPMT_SYM_DEF_OBJECT)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymDefObject {
    pub algorithm: u16,
    pub key_bits: u16,
    pub mode: u16,
}

impl SymDefObject {
    pub const NULL: SymDefObject = SymDefObject {
        algorithm: TPM_ALG_NULL,
        key_bits: 0,
        mode: 0,
    };

    pub const AES_128_CFB: SymDefObject = SymDefObject {
        algorithm: TPM_ALG_AES,
        key_bits: 128,
        mode: TPM_ALG_CFB,
    };

    pub fn marshal(&self, out: &mut Writer) {
        out.write_u16(self.algorithm);
        if self.algorithm != TPM_ALG_NULL {
            out.write_u16(self.key_bits);
            out.write_u16(self.mode);
        }
    }

    pub fn unmarshal(cursor: &mut Cursor<'_>) -> HsmResult<Self> {
        let algorithm = cursor.read_u16()?;
        if algorithm == TPM_ALG_NULL {
            return Ok(Self::NULL);
        }
        Ok(Self {
            algorithm,
            key_bits: cursor.read_u16()?,
            mode: cursor.read_u16()?,
        })
    }
}

/// Signing/encryption/KDF scheme with its hash detail.
///
/// `count` is only present on the wire for ECDAA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheme {
    pub scheme: u16,
    pub hash_alg: u16,
    pub count: u16,
}

impl Scheme {
    pub const NULL: Scheme = Scheme {
        scheme: TPM_ALG_NULL,
        hash_alg: 0,
        count: 0,
    };

    pub fn marshal(&self, out: &mut Writer) {
        out.write_u16(self.scheme);
        if self.scheme != TPM_ALG_NULL {
            out.write_u16(self.hash_alg);
            if self.scheme == TPM_ALG_ECDAA {
                out.write_u16(self.count);
            }
        }
    }

    pub fn unmarshal(cursor: &mut Cursor<'_>) -> HsmResult<Self> {
        let scheme = cursor.read_u16()?;
        if scheme == TPM_ALG_NULL {
            return Ok(Self::NULL);
        }
        let hash_alg = cursor.read_u16()?;
        let count = if scheme == TPM_ALG_ECDAA {
            cursor.read_u16()?
        } else {
            0
        };
        Ok(Self {
            scheme,
            hash_alg,
            count,
        })
    }
}

/// Keyed-hash scheme (TPMT_KEYEDHASH_SCHEME); XOR carries a KDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedHashScheme {
    pub scheme: u16,
    pub hash_alg: u16,
    pub kdf: u16,
}

impl KeyedHashScheme {
    pub const NULL: KeyedHashScheme = KeyedHashScheme {
        scheme: TPM_ALG_NULL,
        hash_alg: 0,
        kdf: 0,
    };

    fn marshal(&self, out: &mut Writer) {
        out.write_u16(self.scheme);
        match self.scheme {
            TPM_ALG_HMAC => {
                out.write_u16(self.hash_alg);
            }
            TPM_ALG_XOR => {
                out.write_u16(self.hash_alg);
                out.write_u16(self.kdf);
            }
            _ => {}
        }
    }

    fn unmarshal(cursor: &mut Cursor<'_>) -> HsmResult<Self> {
        let scheme = cursor.read_u16()?;
        match scheme {
            TPM_ALG_NULL => Ok(Self::NULL),
            TPM_ALG_HMAC => Ok(Self {
                scheme,
                hash_alg: cursor.read_u16()?,
                kdf: 0,
            }),
            TPM_ALG_XOR => Ok(Self {
                scheme,
                hash_alg: cursor.read_u16()?,
                kdf: cursor.read_u16()?,
            }),
            other => Err(HsmError::Codec(format!(
                "unsupported keyed-hash scheme 0x{:04x}",
                other
            ))),
        }
    }
}

/// Algorithm-specific public parameters (TPMU_PUBLIC_PARMS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParms {
    Rsa {
        symmetric: SymDefObject,
        scheme: Scheme,
        key_bits: u16,
        exponent: u32,
    },
    Ecc {
        symmetric: SymDefObject,
        scheme: Scheme,
        curve_id: u16,
        kdf: Scheme,
    },
    KeyedHash {
        scheme: KeyedHashScheme,
    },
    SymCipher {
        symmetric: SymDefObject,
    },
}

impl PublicParms {
    pub fn object_type(&self) -> u16 {
        match self {
            PublicParms::Rsa { .. } => TPM_ALG_RSA,
            PublicParms::Ecc { .. } => TPM_ALG_ECC,
            PublicParms::KeyedHash { .. } => TPM_ALG_KEYEDHASH,
            PublicParms::SymCipher { .. } => TPM_ALG_SYMCIPHER,
        }
    }
}

/// Unique identifier of the object (TPMU_PUBLIC_ID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicUnique {
    /// RSA modulus
    Rsa(Vec<u8>),
    Ecc { x: Vec<u8>, y: Vec<u8> },
    KeyedHash(Vec<u8>),
    SymCipher(Vec<u8>),
}

impl PublicUnique {
    pub fn len(&self) -> usize {
        match self {
            PublicUnique::Rsa(n) => n.len(),
            PublicUnique::Ecc { x, y } => x.len() + y.len(),
            PublicUnique::KeyedHash(d) | PublicUnique::SymCipher(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Public area of a TPM object (TPMT_PUBLIC)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub name_alg: u16,
    pub object_attributes: ObjectAttributes,
    pub auth_policy: Vec<u8>,
    pub parameters: PublicParms,
    pub unique: PublicUnique,
}

impl TpmtPublic {
    pub fn object_type(&self) -> u16 {
        self.parameters.object_type()
    }

    pub fn marshal(&self, out: &mut Writer) -> HsmResult<()> {
        out.write_u16(self.object_type());
        out.write_u16(self.name_alg);
        out.write_u32(self.object_attributes.value());
        out.write_tpm2b(&self.auth_policy)?;

        match &self.parameters {
            PublicParms::Rsa {
                symmetric,
                scheme,
                key_bits,
                exponent,
            } => {
                symmetric.marshal(out);
                scheme.marshal(out);
                out.write_u16(*key_bits);
                out.write_u32(*exponent);
            }
            PublicParms::Ecc {
                symmetric,
                scheme,
                curve_id,
                kdf,
            } => {
                symmetric.marshal(out);
                scheme.marshal(out);
                out.write_u16(*curve_id);
                kdf.marshal(out);
            }
            PublicParms::KeyedHash { scheme } => scheme.marshal(out),
            PublicParms::SymCipher { symmetric } => symmetric.marshal(out),
        }

        match (&self.parameters, &self.unique) {
            (PublicParms::Rsa { .. }, PublicUnique::Rsa(n)) => {
                out.write_tpm2b(n)?;
            }
            (PublicParms::Ecc { .. }, PublicUnique::Ecc { x, y }) => {
                out.write_tpm2b(x)?;
                out.write_tpm2b(y)?;
            }
            (PublicParms::KeyedHash { .. }, PublicUnique::KeyedHash(d))
            | (PublicParms::SymCipher { .. }, PublicUnique::SymCipher(d)) => {
                out.write_tpm2b(d)?;
            }
            _ => {
                return Err(HsmError::Codec(
                    "public unique field does not match the object type".into(),
                ))
            }
        }
        Ok(())
    }

    /// Unmarshal a public area; `allow_null_name_alg` is the TPM "flag" that
    /// admits TPM_ALG_NULL as name algorithm.
    pub fn unmarshal(cursor: &mut Cursor<'_>, allow_null_name_alg: bool) -> HsmResult<Self> {
        let object_type = cursor.read_u16()?;
        let name_alg = cursor.read_u16()?;
        if !(is_hash_alg(name_alg) || (allow_null_name_alg && name_alg == TPM_ALG_NULL)) {
            return Err(HsmError::Codec(format!(
                "invalid name algorithm 0x{:04x}",
                name_alg
            )));
        }
        let object_attributes = ObjectAttributes::from_bits(cursor.read_u32()?);
        let auth_policy = cursor.read_tpm2b()?.to_vec();

        let (parameters, unique) = match object_type {
            TPM_ALG_RSA => {
                let parameters = PublicParms::Rsa {
                    symmetric: SymDefObject::unmarshal(cursor)?,
                    scheme: Scheme::unmarshal(cursor)?,
                    key_bits: cursor.read_u16()?,
                    exponent: cursor.read_u32()?,
                };
                (parameters, PublicUnique::Rsa(cursor.read_tpm2b()?.to_vec()))
            }
            TPM_ALG_ECC => {
                let parameters = PublicParms::Ecc {
                    symmetric: SymDefObject::unmarshal(cursor)?,
                    scheme: Scheme::unmarshal(cursor)?,
                    curve_id: cursor.read_u16()?,
                    kdf: Scheme::unmarshal(cursor)?,
                };
                let x = cursor.read_tpm2b()?.to_vec();
                let y = cursor.read_tpm2b()?.to_vec();
                (parameters, PublicUnique::Ecc { x, y })
            }
            TPM_ALG_KEYEDHASH => {
                let parameters = PublicParms::KeyedHash {
                    scheme: KeyedHashScheme::unmarshal(cursor)?,
                };
                (
                    parameters,
                    PublicUnique::KeyedHash(cursor.read_tpm2b()?.to_vec()),
                )
            }
            TPM_ALG_SYMCIPHER => {
                let parameters = PublicParms::SymCipher {
                    symmetric: SymDefObject::unmarshal(cursor)?,
                };
                (
                    parameters,
                    PublicUnique::SymCipher(cursor.read_tpm2b()?.to_vec()),
                )
            }
            other => {
                return Err(HsmError::Codec(format!(
                    "unsupported object type 0x{:04x}",
                    other
                )))
            }
        };

        Ok(Self {
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// Size-prefixed public area (TPM2B_PUBLIC)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPublic {
    pub public_area: TpmtPublic,
}

impl Tpm2bPublic {
    pub fn new(public_area: TpmtPublic) -> Self {
        Self { public_area }
    }

    pub fn marshal(&self, out: &mut Writer) -> HsmResult<()> {
        let mut inner = Writer::new();
        self.public_area.marshal(&mut inner)?;
        out.write_tpm2b(&inner.into_bytes())?;
        Ok(())
    }

    pub fn to_bytes(&self) -> HsmResult<Vec<u8>> {
        let mut out = Writer::new();
        self.marshal(&mut out)?;
        Ok(out.into_bytes())
    }

    /// Unmarshal a TPM2B_PUBLIC. A zero size is rejected, and the declared
    /// size must match the public area exactly.
    pub fn unmarshal(cursor: &mut Cursor<'_>, allow_null_name_alg: bool) -> HsmResult<Self> {
        let size = cursor.read_u16()? as usize;
        if size == 0 {
            return Err(HsmError::Codec("TPM2B_PUBLIC has zero size".into()));
        }
        let mut inner = cursor.sub_cursor(size)?;
        let public_area = TpmtPublic::unmarshal(&mut inner, allow_null_name_alg)?;
        if !inner.is_empty() {
            return Err(HsmError::Codec(format!(
                "TPM2B_PUBLIC size mismatch: {} trailing bytes",
                inner.remaining()
            )));
        }
        Ok(Self { public_area })
    }

    pub fn from_bytes(bytes: &[u8], allow_null_name_alg: bool) -> HsmResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let public = Self::unmarshal(&mut cursor, allow_null_name_alg)?;
        if !cursor.is_empty() {
            return Err(HsmError::Codec("trailing bytes after TPM2B_PUBLIC".into()));
        }
        Ok(public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_key_public() -> TpmtPublic {
        TpmtPublic {
            name_alg: TPM_ALG_SHA256,
            object_attributes: ObjectAttributes::new()
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
            unique: PublicUnique::KeyedHash(vec![0x11; 32]),
        }
    }

    #[test]
    fn test_cursor_rejects_over_read() {
        let data = [0x00, 0x05, 0xAA, 0xBB];
        let mut cursor = Cursor::new(&data);

        let err = cursor.read_tpm2b().unwrap_err();
        assert!(matches!(err, HsmError::Codec(_)));
    }

    #[test]
    fn test_cursor_tracks_remaining() {
        let data = [0x00, 0x02, 0xAA, 0xBB, 0x01];
        let mut cursor = Cursor::new(&data);

        assert_eq!(cursor.read_tpm2b().unwrap(), &[0xAA, 0xBB]);
        assert_eq!(cursor.remaining(), 1);
        assert_eq!(cursor.offset(), 4);
        assert_eq!(cursor.read_u8().unwrap(), 1);
        assert!(cursor.is_empty());
        assert!(cursor.read_u8().is_err());
    }

    #[test]
    fn test_writer_rejects_oversized_tpm2b() {
        let mut out = Writer::new();
        assert!(out.write_tpm2b(&vec![0u8; 70_000]).is_err());
    }

    #[test]
    fn test_keyed_hash_public_round_trip() {
        let public = Tpm2bPublic::new(hmac_key_public());
        let bytes = public.to_bytes().unwrap();

        assert_eq!(Tpm2bPublic::from_bytes(&bytes, true).unwrap(), public);
        // type KEYEDHASH, nameAlg SHA256
        assert_eq!(&bytes[2..6], &[0x00, 0x08, 0x00, 0x0B]);
    }

    #[test]
    fn test_ecc_public_round_trip() {
        let public = Tpm2bPublic::new(TpmtPublic {
            name_alg: TPM_ALG_SHA256,
            object_attributes: ObjectAttributes::new().fixed_tpm().sign_encrypt(),
            auth_policy: vec![0x42; 32],
            parameters: PublicParms::Ecc {
                symmetric: SymDefObject::NULL,
                scheme: Scheme {
                    scheme: TPM_ALG_ECDAA,
                    hash_alg: TPM_ALG_SHA256,
                    count: 7,
                },
                curve_id: TPM_ECC_NIST_P256,
                kdf: Scheme::NULL,
            },
            unique: PublicUnique::Ecc {
                x: vec![1; 32],
                y: vec![2; 32],
            },
        });
        let bytes = public.to_bytes().unwrap();

        assert_eq!(Tpm2bPublic::from_bytes(&bytes, false).unwrap(), public);
    }

    #[test]
    fn test_zero_size_public_rejected() {
        let err = Tpm2bPublic::from_bytes(&[0x00, 0x00], true).unwrap_err();
        assert!(matches!(err, HsmError::Codec(_)));
    }

    #[test]
    fn test_null_name_alg_requires_flag() {
        let mut public = hmac_key_public();
        public.name_alg = TPM_ALG_NULL;
        let bytes = Tpm2bPublic::new(public).to_bytes().unwrap();

        assert!(Tpm2bPublic::from_bytes(&bytes, true).is_ok());
        assert!(matches!(
            Tpm2bPublic::from_bytes(&bytes, false),
            Err(HsmError::Codec(_))
        ));
    }

    #[test]
    fn test_declared_size_must_match_content() {
        let mut bytes = Tpm2bPublic::new(hmac_key_public()).to_bytes().unwrap();
        // Grow the declared size and append a stray byte inside the sized region
        let size = u16::from_be_bytes([bytes[0], bytes[1]]) + 1;
        bytes[..2].copy_from_slice(&size.to_be_bytes());
        bytes.push(0xFF);

        assert!(matches!(
            Tpm2bPublic::from_bytes(&bytes, true),
            Err(HsmError::Codec(_))
        ));
    }

    #[test]
    fn test_mismatched_unique_is_rejected_on_marshal() {
        let mut public = hmac_key_public();
        public.unique = PublicUnique::Rsa(vec![0; 4]);
        assert!(Tpm2bPublic::new(public).to_bytes().is_err());
    }
}
