//! Shared access signature (SAS) token assembly.
//!
//! ```text
//! SharedAccessSignature sr=<scope>&sig=<urlencode(base64(hmac))>&se=<expiry>&skn=<key name>
//! ```
//!
//! The HMAC covers `"<scope>\n<expiry>"`. Who computes it depends on the
//! backend; this module only frames the payload and the token.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{HsmError, HsmResult};

type HmacSha256 = Hmac<Sha256>;

/// Everything except alphanumerics and `! ( ) * - . _` is escaped; a space
/// becomes `%20`, never `+`.
const SAS_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');

/// Bytes the backend signs for `scope` valid until `expiry` (Unix seconds).
pub fn signing_payload(scope: &str, expiry: u64) -> HsmResult<String> {
    if scope.is_empty() {
        return Err(HsmError::InvalidArgument("token scope is empty".into()));
    }
    Ok(format!("{}\n{}", scope, expiry))
}

/// HMAC-SHA256 of `payload` under a base64 encoded key.
pub fn hmac_with_encoded_key(encoded_key: &str, payload: &[u8]) -> HsmResult<Vec<u8>> {
    let key = Zeroizing::new(
        STANDARD
            .decode(encoded_key)
            .map_err(|e| HsmError::InvalidArgument(format!("symmetric key is not base64: {}", e)))?,
    );
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| HsmError::Signing(format!("HMAC key rejected: {}", e)))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, SAS_ENCODE_SET).to_string()
}

/// Assemble the token from a finished signature.
pub fn format_token(
    scope: &str,
    signature: &[u8],
    expiry: u64,
    key_name: Option<&str>,
) -> HsmResult<String> {
    if signature.is_empty() {
        return Err(HsmError::Signing("signature is empty".into()));
    }
    let sig = url_encode(&STANDARD.encode(signature));
    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        scope,
        sig,
        expiry,
        key_name.unwrap_or_default()
    ))
}
