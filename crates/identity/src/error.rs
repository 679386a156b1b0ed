//! Error types for DevAuth identity operations.
//!
//! The variants follow the failure classes a caller has to tell apart:
//! bad input, a malformed activation blob, a failing TPM command or signing
//! primitive, and calling an operation the configured backend does not offer.
//! Nothing in this crate retries; the caller owns retry policy.

use std::fmt;
use thiserror::Error;

/// Individual TPM commands issued by the provisioning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TpmStep {
    Open,
    ReadPublic,
    CreatePrimary,
    EvictControl,
    FlushContext,
    StartPolicySession,
    PolicySecret,
    GetProperty,
    ActivateCredential,
    Import,
    Load,
    Hmac,
}

impl TpmStep {
    /// Stable numeric code, unique per step.
    pub fn code(self) -> i32 {
        match self {
            TpmStep::Open => 1,
            TpmStep::ReadPublic => 2,
            TpmStep::CreatePrimary => 3,
            TpmStep::EvictControl => 4,
            TpmStep::FlushContext => 5,
            TpmStep::StartPolicySession => 6,
            TpmStep::PolicySecret => 7,
            TpmStep::GetProperty => 8,
            TpmStep::ActivateCredential => 9,
            TpmStep::Import => 10,
            TpmStep::Load => 11,
            TpmStep::Hmac => 12,
        }
    }
}

impl fmt::Display for TpmStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TpmStep::Open => "Open",
            TpmStep::ReadPublic => "ReadPublic",
            TpmStep::CreatePrimary => "CreatePrimary",
            TpmStep::EvictControl => "EvictControl",
            TpmStep::FlushContext => "FlushContext",
            TpmStep::StartPolicySession => "StartAuthSession",
            TpmStep::PolicySecret => "PolicySecret",
            TpmStep::GetProperty => "GetCapability",
            TpmStep::ActivateCredential => "ActivateCredential",
            TpmStep::Import => "Import",
            TpmStep::Load => "Load",
            TpmStep::Hmac => "HMAC",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in HSM and credential operations.
#[derive(Debug, Error)]
pub enum HsmError {
    /// A required argument was missing or empty
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed or truncated TPM structure
    #[error("Codec error: {0}")]
    Codec(String),

    /// A TPM command failed
    #[error("TPM {step} failed: {reason}")]
    Device { step: TpmStep, reason: String },

    /// A software signing or derivation primitive failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// The edge workload service failed or answered badly
    #[error("Edge workload error: {0}")]
    Http(String),

    /// Operation not offered by the configured backend, or a type mismatch
    #[error("Protocol sequence error: {0}")]
    ProtocolSequence(String),

    /// Certificate building, encoding or parsing errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Value requested before it was provisioned
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] devauth_core::Error),
}

impl HsmError {
    pub(crate) fn device(step: TpmStep, reason: impl Into<String>) -> Self {
        HsmError::Device {
            step,
            reason: reason.into(),
        }
    }

    /// Non-zero status code, distinct per failure class and per TPM step.
    pub fn code(&self) -> i32 {
        match self {
            HsmError::InvalidArgument(_) => 1,
            HsmError::Codec(_) => 2,
            HsmError::Signing(_) => 3,
            HsmError::Http(_) => 4,
            HsmError::ProtocolSequence(_) => 5,
            HsmError::Certificate(_) => 6,
            HsmError::InvalidState(_) => 7,
            HsmError::Config(_) => 8,
            HsmError::Serialization(_) => 9,
            HsmError::Io(_) => 10,
            HsmError::Core(_) => 11,
            HsmError::Device { step, .. } => 100 + step.code(),
        }
    }
}

impl From<der::Error> for HsmError {
    fn from(err: der::Error) -> Self {
        HsmError::Certificate(err.to_string())
    }
}

/// Result type for HSM operations.
pub type HsmResult<T> = Result<T, HsmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL_STEPS: [TpmStep; 12] = [
        TpmStep::Open,
        TpmStep::ReadPublic,
        TpmStep::CreatePrimary,
        TpmStep::EvictControl,
        TpmStep::FlushContext,
        TpmStep::StartPolicySession,
        TpmStep::PolicySecret,
        TpmStep::GetProperty,
        TpmStep::ActivateCredential,
        TpmStep::Import,
        TpmStep::Load,
        TpmStep::Hmac,
    ];

    #[test]
    fn test_step_codes_are_distinct() {
        let codes: HashSet<i32> = ALL_STEPS
            .iter()
            .map(|step| HsmError::device(*step, "x").code())
            .collect();
        assert_eq!(codes.len(), ALL_STEPS.len());
        assert!(codes.iter().all(|code| *code > 100));
    }

    #[test]
    fn test_class_codes_non_zero() {
        let errors = [
            HsmError::InvalidArgument("a".into()),
            HsmError::Codec("b".into()),
            HsmError::ProtocolSequence("c".into()),
        ];
        assert!(errors.iter().all(|e| e.code() != 0));
        assert_ne!(errors[1].code(), HsmError::device(TpmStep::Import, "x").code());
    }

    #[test]
    fn test_device_display_names_step() {
        let err = HsmError::device(TpmStep::ActivateCredential, "rc 0x922");
        assert_eq!(err.to_string(), "TPM ActivateCredential failed: rc 0x922");
    }
}
