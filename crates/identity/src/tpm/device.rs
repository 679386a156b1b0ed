//! Command-level TPM interface.
//!
//! [`TpmDevice`] is the seam between the provisioning engine and whatever
//! executes TPM commands: the in-process [`SoftwareTpm`](super::SoftwareTpm)
//! or, with the `hardware-tpm` feature, a `tss-esapi` context.

use super::marshal::{SymDefObject, Tpm2bPublic};
use crate::error::HsmResult;

/// Owner hierarchy authorization handle
pub const TPM_RH_OWNER: u32 = 0x4000_0001;
/// Endorsement hierarchy authorization handle
pub const TPM_RH_ENDORSEMENT: u32 = 0x4000_000B;
/// Password authorization session handle
pub const TPM_RS_PW: u32 = 0x4000_0009;

/// Persistent Storage Root Key handle
pub const TPM_20_SRK_HANDLE: u32 = 0x8100_0001;
/// Persistent Endorsement Key handle
pub const TPM_20_EK_HANDLE: u32 = 0x8101_0001;
/// Persistent handle holding the imported device identity key
pub const IDENTITY_KEY_HANDLE: u32 = 0x8100_0100;

/// TPM_PT_INPUT_BUFFER: largest TPM2B_MAX_BUFFER the TPM accepts
pub const TPM_PT_INPUT_BUFFER: u32 = 0x0000_010D;

/// First handle of the persistent range
pub const PERSISTENT_FIRST: u32 = 0x8100_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    Owner,
    Endorsement,
}

impl Hierarchy {
    pub fn handle(self) -> u32 {
        match self {
            Hierarchy::Owner => TPM_RH_OWNER,
            Hierarchy::Endorsement => TPM_RH_ENDORSEMENT,
        }
    }
}

/// Handle of a loaded or persistent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u32);

impl ObjectHandle {
    pub fn is_persistent(self) -> bool {
        self.0 >= PERSISTENT_FIRST
    }
}

/// Handle of an authorization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// TPM commands used by the provisioning engine.
///
/// Commands authorized by a password run under an empty password session
/// (`TPM_RS_PW`). Implementations map TPM response codes onto
/// [`HsmError::Device`](crate::HsmError::Device) with the matching step.
pub trait TpmDevice {
    /// TPM2_ReadPublic
    fn read_public(&mut self, handle: ObjectHandle) -> HsmResult<Tpm2bPublic>;

    /// TPM2_CreatePrimary; returns the transient handle and the public area.
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Tpm2bPublic,
    ) -> HsmResult<(ObjectHandle, Tpm2bPublic)>;

    /// TPM2_EvictControl under owner authorization. Passing a persistent
    /// `object` equal to `persistent` removes it.
    fn evict_control(&mut self, object: ObjectHandle, persistent: ObjectHandle) -> HsmResult<()>;

    /// TPM2_StartAuthSession for a SHA-256 policy session.
    fn start_policy_session(&mut self) -> HsmResult<SessionHandle>;

    /// TPM2_PolicySecret against the given hierarchy.
    fn policy_secret(&mut self, session: SessionHandle, auth: Hierarchy) -> HsmResult<()>;

    /// TPM2_ActivateCredential; `key` is authorized by `session`, which the
    /// command consumes.
    fn activate_credential(
        &mut self,
        activate: ObjectHandle,
        key: ObjectHandle,
        session: SessionHandle,
        id_object: &[u8],
        encrypted_secret: &[u8],
    ) -> HsmResult<Vec<u8>>;

    /// TPM2_Import; returns the private area re-wrapped under `parent`.
    fn import(
        &mut self,
        parent: ObjectHandle,
        encryption_key: &[u8],
        public: &Tpm2bPublic,
        duplicate: &[u8],
        in_sym_seed: &[u8],
        symmetric: SymDefObject,
    ) -> HsmResult<Vec<u8>>;

    /// TPM2_Load
    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &[u8],
        public: &Tpm2bPublic,
    ) -> HsmResult<ObjectHandle>;

    /// TPM2_FlushContext for an object or session handle.
    fn flush_context(&mut self, handle: u32) -> HsmResult<()>;

    /// TPM2_HMAC with the key's own scheme.
    fn hmac(&mut self, key: ObjectHandle, data: &[u8]) -> HsmResult<Vec<u8>>;

    /// TPM2_GetCapability(TPM_PT_INPUT_BUFFER)
    fn input_buffer_size(&mut self) -> HsmResult<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_range() {
        assert!(ObjectHandle(TPM_20_EK_HANDLE).is_persistent());
        assert!(ObjectHandle(IDENTITY_KEY_HANDLE).is_persistent());
        assert!(!ObjectHandle(0x8000_0000).is_persistent());
    }

    #[test]
    fn test_hierarchy_handles() {
        assert_eq!(Hierarchy::Owner.handle(), 0x4000_0001);
        assert_eq!(Hierarchy::Endorsement.handle(), 0x4000_000B);
    }
}
