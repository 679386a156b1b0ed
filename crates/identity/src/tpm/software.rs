//! In-process TPM stub.
//!
//! Keeps primary, persistent and transient objects in memory and implements
//! the credential protection of ActivateCredential/Import with hash-based
//! masks instead of RSA/AES. It provides no confidentiality; it exists so the
//! provisioning flow can run end to end on machines without a TPM.
//!
//! Clones share the same state, the way every client in a process shares
//! one physical TPM.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::warn;
use zeroize::Zeroizing;

use super::device::{Hierarchy, ObjectHandle, SessionHandle, TpmDevice};
use super::marshal::{Cursor, PublicParms, PublicUnique, SymDefObject, Tpm2bPublic, Writer};
use crate::error::{HsmError, HsmResult, TpmStep};

type HmacSha256 = Hmac<Sha256>;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const POLICY_SESSION_FIRST: u32 = 0x0300_0000;
const DEFAULT_INPUT_BUFFER: u32 = 1024;

#[derive(Clone)]
struct SoftObject {
    public: Tpm2bPublic,
    sensitive: Zeroizing<Vec<u8>>,
}

#[derive(Default)]
struct SoftState {
    seed: Zeroizing<[u8; 32]>,
    persistent: HashMap<u32, SoftObject>,
    transient: HashMap<u32, SoftObject>,
    /// Session handle -> PolicySecret(endorsement) satisfied
    sessions: HashMap<u32, bool>,
    next_transient: u32,
    next_session: u32,
    input_buffer: u32,
    /// Only kept once `with_recorder` opts in.
    commands: Option<Vec<TpmStep>>,
    fail_next: Option<TpmStep>,
}

impl SoftState {
    fn object(&self, handle: ObjectHandle) -> Option<&SoftObject> {
        if handle.is_persistent() {
            self.persistent.get(&handle.0)
        } else {
            self.transient.get(&handle.0)
        }
    }

    fn insert_transient(&mut self, object: SoftObject) -> ObjectHandle {
        let handle = self.next_transient;
        self.next_transient = self.next_transient.wrapping_add(1).max(TRANSIENT_FIRST);
        self.transient.insert(handle, object);
        ObjectHandle(handle)
    }
}

/// Software stand-in for a TPM 2.0 device.
#[derive(Clone)]
pub struct SoftwareTpm {
    state: Arc<Mutex<SoftState>>,
}

impl SoftwareTpm {
    /// Stub TPM with a random primary seed.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Stub TPM whose primary keys are derived from `seed`.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        warn!("STATUS: SoftwareTpm :: Hardware Root of Trust :: STUBBED");
        let state = SoftState {
            seed: Zeroizing::new(seed),
            next_transient: TRANSIENT_FIRST,
            next_session: POLICY_SESSION_FIRST,
            input_buffer: DEFAULT_INPUT_BUFFER,
            ..SoftState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Override the reported TPM_PT_INPUT_BUFFER property.
    pub fn with_input_buffer(self, size: u32) -> Self {
        self.state().input_buffer = size;
        self
    }

    /// Record every command issued from now on; see [`command_log`](Self::command_log).
    pub fn with_recorder(self) -> Self {
        self.state().commands.get_or_insert_with(Vec::new);
        self
    }

    /// Commands issued since the recorder was enabled, oldest first.
    pub fn command_log(&self) -> Vec<TpmStep> {
        self.state().commands.clone().unwrap_or_default()
    }

    /// Make the next command of kind `step` fail with a device error.
    pub fn fail_next(&self, step: TpmStep) {
        self.state().fail_next = Some(step);
    }

    /// Whether a persistent handle is occupied.
    pub fn has_persistent(&self, handle: u32) -> bool {
        self.state().persistent.contains_key(&handle)
    }

    /// Number of live transient objects.
    pub fn transient_count(&self) -> usize {
        self.state().transient.len()
    }

    /// Service side of the credential protocol (TPM2_MakeCredential):
    /// protect `credential` for the TPM owning `ek_public`.
    ///
    /// Returns `(id_object, encrypted_secret)`.
    pub fn make_credential(
        ek_public: &Tpm2bPublic,
        credential: &[u8],
        seed: &[u8],
    ) -> HsmResult<(Vec<u8>, Vec<u8>)> {
        let ek_name = object_name(ek_public)?;
        let mut plain = Writer::new();
        plain.write_tpm2b(credential)?;
        let enc_identity = xor_mask(&derive(b"STORAGE", &[seed, &ek_name]), &plain.into_bytes());
        let integrity = integrity_hmac(seed, &enc_identity, &ek_name)?;

        let mut id_object = Writer::new();
        id_object.write_tpm2b(&integrity)?;
        id_object.write_bytes(&enc_identity);
        Ok((id_object.into_bytes(), seed.to_vec()))
    }

    /// Service side of TPM2_Duplicate: wrap a keyed-hash secret under the
    /// inner wrap key delivered through ActivateCredential.
    pub fn duplicate(sensitive: &[u8], inner_wrap_key: &[u8]) -> HsmResult<Vec<u8>> {
        let mut plain = Writer::new();
        plain.write_tpm2b(sensitive)?;
        Ok(xor_mask(&derive(b"DUPLICATE", &[inner_wrap_key]), &plain.into_bytes()))
    }

    /// State access for inspection and setup; a poisoned lock still holds
    /// consistent maps, so the guard is recovered.
    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// State access for a TPM command.
    fn lock(&self, step: TpmStep) -> HsmResult<MutexGuard<'_, SoftState>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| HsmError::device(step, "software TPM state poisoned"))?;
        if let Some(commands) = state.commands.as_mut() {
            commands.push(step);
        }
        if state.fail_next == Some(step) {
            state.fail_next = None;
            return Err(HsmError::device(step, "TPM_RC_FAILURE"));
        }
        Ok(state)
    }
}

impl Default for SoftwareTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftwareTpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareTpm").finish_non_exhaustive()
    }
}

fn derive(label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor_mask(key: &[u8; 32], data: &[u8]) -> Vec<u8> {
    data.chunks(32)
        .enumerate()
        .flat_map(|(counter, chunk)| {
            let block: [u8; 32] = Sha256::new()
                .chain_update(key)
                .chain_update((counter as u32).to_be_bytes())
                .finalize()
                .into();
            chunk
                .iter()
                .zip(block)
                .map(|(byte, mask)| byte ^ mask)
                .collect::<Vec<u8>>()
        })
        .collect()
}

fn object_name(public: &Tpm2bPublic) -> HsmResult<Vec<u8>> {
    let mut area = Writer::new();
    public.public_area.marshal(&mut area)?;
    Ok(Sha256::digest(area.into_bytes()).to_vec())
}

fn integrity_hmac(seed: &[u8], enc_identity: &[u8], name: &[u8]) -> HsmResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(&derive(b"INTEGRITY", &[seed]))
        .map_err(|e| HsmError::Signing(e.to_string()))?;
    mac.update(enc_identity);
    mac.update(name);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Unwrap a masked TPM2B; the declared size must cover the plaintext exactly.
fn unmask_tpm2b(key: &[u8; 32], data: &[u8], step: TpmStep) -> HsmResult<Zeroizing<Vec<u8>>> {
    let plain = Zeroizing::new(xor_mask(key, data));
    let mut cursor = Cursor::new(&plain);
    let inner = cursor
        .read_tpm2b()
        .map_err(|_| HsmError::device(step, "TPM_RC_INTEGRITY"))?;
    if !cursor.is_empty() {
        return Err(HsmError::device(step, "TPM_RC_INTEGRITY"));
    }
    Ok(Zeroizing::new(inner.to_vec()))
}

impl TpmDevice for SoftwareTpm {
    fn read_public(&mut self, handle: ObjectHandle) -> HsmResult<Tpm2bPublic> {
        let state = self.lock(TpmStep::ReadPublic)?;
        state
            .object(handle)
            .map(|object| object.public.clone())
            .ok_or_else(|| {
                HsmError::device(TpmStep::ReadPublic, format!("TPM_RC_HANDLE 0x{:08x}", handle.0))
            })
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Tpm2bPublic,
    ) -> HsmResult<(ObjectHandle, Tpm2bPublic)> {
        let mut state = self.lock(TpmStep::CreatePrimary)?;
        let template_bytes = template.to_bytes()?;
        let hierarchy_bytes = hierarchy.handle().to_be_bytes();
        let parts: [&[u8]; 3] = [state.seed.as_slice(), &hierarchy_bytes, &template_bytes];
        let unique_key = derive(b"PRIMARY", &parts);
        let sensitive = Zeroizing::new(derive(b"SENSITIVE", &parts).to_vec());

        let mut public = template.clone();
        public.public_area.unique = match &template.public_area.parameters {
            PublicParms::Rsa { key_bits, .. } => PublicUnique::Rsa(xor_mask(
                &unique_key,
                &vec![0u8; usize::from(*key_bits / 8)],
            )),
            PublicParms::Ecc { .. } => PublicUnique::Ecc {
                x: derive(b"X", &[&unique_key]).to_vec(),
                y: derive(b"Y", &[&unique_key]).to_vec(),
            },
            PublicParms::KeyedHash { .. } => PublicUnique::KeyedHash(unique_key.to_vec()),
            PublicParms::SymCipher { .. } => PublicUnique::SymCipher(unique_key.to_vec()),
        };

        let handle = state.insert_transient(SoftObject {
            public: public.clone(),
            sensitive,
        });
        Ok((handle, public))
    }

    fn evict_control(&mut self, object: ObjectHandle, persistent: ObjectHandle) -> HsmResult<()> {
        let mut state = self.lock(TpmStep::EvictControl)?;
        if !persistent.is_persistent() {
            return Err(HsmError::device(TpmStep::EvictControl, "TPM_RC_RANGE"));
        }
        if object.is_persistent() {
            if object != persistent {
                return Err(HsmError::device(TpmStep::EvictControl, "TPM_RC_HANDLE"));
            }
            return state
                .persistent
                .remove(&persistent.0)
                .map(|_| ())
                .ok_or_else(|| HsmError::device(TpmStep::EvictControl, "TPM_RC_HANDLE"));
        }
        if state.persistent.contains_key(&persistent.0) {
            return Err(HsmError::device(TpmStep::EvictControl, "TPM_RC_NV_DEFINED"));
        }
        let loaded = state
            .transient
            .get(&object.0)
            .cloned()
            .ok_or_else(|| HsmError::device(TpmStep::EvictControl, "TPM_RC_HANDLE"))?;
        state.persistent.insert(persistent.0, loaded);
        Ok(())
    }

    fn start_policy_session(&mut self) -> HsmResult<SessionHandle> {
        let mut state = self.lock(TpmStep::StartPolicySession)?;
        let handle = state.next_session;
        state.next_session = state.next_session.wrapping_add(1);
        state.sessions.insert(handle, false);
        Ok(SessionHandle(handle))
    }

    fn policy_secret(&mut self, session: SessionHandle, auth: Hierarchy) -> HsmResult<()> {
        let mut state = self.lock(TpmStep::PolicySecret)?;
        let satisfied = state
            .sessions
            .get_mut(&session.0)
            .ok_or_else(|| HsmError::device(TpmStep::PolicySecret, "TPM_RC_HANDLE"))?;
        *satisfied = auth == Hierarchy::Endorsement;
        Ok(())
    }

    fn activate_credential(
        &mut self,
        activate: ObjectHandle,
        key: ObjectHandle,
        session: SessionHandle,
        id_object: &[u8],
        encrypted_secret: &[u8],
    ) -> HsmResult<Vec<u8>> {
        let step = TpmStep::ActivateCredential;
        let mut state = self.lock(step)?;
        let satisfied = state
            .sessions
            .remove(&session.0)
            .ok_or_else(|| HsmError::device(step, "TPM_RC_HANDLE (session)"))?;
        if !satisfied {
            return Err(HsmError::device(step, "TPM_RC_POLICY_FAIL"));
        }
        if state.object(activate).is_none() {
            return Err(HsmError::device(step, "TPM_RC_HANDLE (activate)"));
        }
        let ek = state
            .object(key)
            .ok_or_else(|| HsmError::device(step, "TPM_RC_HANDLE (key)"))?;
        let ek_name = object_name(&ek.public)?;

        let mut cursor = Cursor::new(id_object);
        let integrity = cursor
            .read_tpm2b()
            .map_err(|_| HsmError::device(step, "TPM_RC_SIZE"))?;
        let enc_identity = cursor.read_bytes(cursor.remaining())?;

        let mut mac = HmacSha256::new_from_slice(&derive(b"INTEGRITY", &[encrypted_secret]))
            .map_err(|e| HsmError::Signing(e.to_string()))?;
        mac.update(enc_identity);
        mac.update(&ek_name);
        mac.verify_slice(integrity)
            .map_err(|_| HsmError::device(step, "TPM_RC_INTEGRITY"))?;

        let mask = derive(b"STORAGE", &[encrypted_secret, &ek_name]);
        let credential = unmask_tpm2b(&mask, enc_identity, step)?;
        Ok(credential.to_vec())
    }

    fn import(
        &mut self,
        parent: ObjectHandle,
        encryption_key: &[u8],
        public: &Tpm2bPublic,
        duplicate: &[u8],
        _in_sym_seed: &[u8],
        symmetric: SymDefObject,
    ) -> HsmResult<Vec<u8>> {
        let step = TpmStep::Import;
        let state = self.lock(step)?;
        let parent_object = state
            .object(parent)
            .ok_or_else(|| HsmError::device(step, "TPM_RC_HANDLE (parent)"))?;
        if symmetric != SymDefObject::NULL && encryption_key.is_empty() {
            return Err(HsmError::device(step, "TPM_RC_SIZE (encryption key)"));
        }
        if !matches!(public.public_area.parameters, PublicParms::KeyedHash { .. }) {
            return Err(HsmError::device(step, "TPM_RC_TYPE"));
        }

        let sensitive = unmask_tpm2b(&derive(b"DUPLICATE", &[encryption_key]), duplicate, step)?;

        let name = object_name(public)?;
        let wrap = derive(b"PRIVATE", &[parent_object.sensitive.as_slice(), &name]);
        let mut plain = Writer::new();
        plain.write_tpm2b(&sensitive)?;
        Ok(xor_mask(&wrap, &Zeroizing::new(plain.into_bytes())))
    }

    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &[u8],
        public: &Tpm2bPublic,
    ) -> HsmResult<ObjectHandle> {
        let step = TpmStep::Load;
        let mut state = self.lock(step)?;
        let parent_sensitive = state
            .object(parent)
            .map(|object| object.sensitive.clone())
            .ok_or_else(|| HsmError::device(step, "TPM_RC_HANDLE (parent)"))?;

        let name = object_name(public)?;
        let wrap = derive(b"PRIVATE", &[parent_sensitive.as_slice(), &name]);
        let sensitive = unmask_tpm2b(&wrap, private, step)?;

        Ok(state.insert_transient(SoftObject {
            public: public.clone(),
            sensitive,
        }))
    }

    fn flush_context(&mut self, handle: u32) -> HsmResult<()> {
        let mut state = self.lock(TpmStep::FlushContext)?;
        let flushed =
            state.transient.remove(&handle).is_some() || state.sessions.remove(&handle).is_some();
        if flushed {
            Ok(())
        } else {
            Err(HsmError::device(
                TpmStep::FlushContext,
                format!("TPM_RC_HANDLE 0x{:08x}", handle),
            ))
        }
    }

    fn hmac(&mut self, key: ObjectHandle, data: &[u8]) -> HsmResult<Vec<u8>> {
        let step = TpmStep::Hmac;
        let state = self.lock(step)?;
        if data.len() > state.input_buffer as usize {
            return Err(HsmError::device(step, "TPM_RC_SIZE"));
        }
        let object = state
            .object(key)
            .ok_or_else(|| HsmError::device(step, "TPM_RC_HANDLE"))?;
        if !matches!(object.public.public_area.parameters, PublicParms::KeyedHash { .. }) {
            return Err(HsmError::device(step, "TPM_RC_TYPE"));
        }
        let mut mac = HmacSha256::new_from_slice(&object.sensitive)
            .map_err(|e| HsmError::Signing(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn input_buffer_size(&mut self) -> HsmResult<u32> {
        let state = self.lock(TpmStep::GetProperty)?;
        Ok(state.input_buffer)
    }
}
