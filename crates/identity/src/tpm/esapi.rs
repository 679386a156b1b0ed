//! Hardware TPM access through `tss-esapi`.

use std::collections::HashMap;
use std::str::FromStr;

use tss_esapi::{
    constants::{PropertyTag, SessionType},
    handles::{KeyHandle, ObjectHandle as EsysHandle, PersistentTpmHandle, TpmHandle},
    interface_types::{
        algorithm::HashingAlgorithm,
        dynamic_handles::Persistent,
        resource_handles::{AuthHandle, Hierarchy as EsysHierarchy, Provision},
        session_handles::{AuthSession, PolicySession},
    },
    structures::{
        Data, Digest, EncryptedSecret, IdObject, MaxBuffer, Nonce, Private, Public,
        SymmetricDefinition, SymmetricDefinitionObject,
    },
    tcti_ldr::{DeviceConfig, TctiNameConf},
    traits::{Marshall, UnMarshall},
    Context,
};
use tracing::info;

use super::device::{Hierarchy, ObjectHandle, SessionHandle, TpmDevice};
use super::marshal::{Cursor, SymDefObject, Tpm2bPublic, TpmtPublic, Writer};
use crate::error::{HsmError, HsmResult, TpmStep};

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const POLICY_SESSION_FIRST: u32 = 0x0300_0000;

/// TPM device driven through the ESAPI of the TPM2 Software Stack.
pub struct EsapiTpm {
    context: Context,
    transient: HashMap<u32, EsysHandle>,
    sessions: HashMap<u32, PolicySession>,
    next_id: u32,
    next_session: u32,
}

fn failed(step: TpmStep) -> impl Fn(tss_esapi::Error) -> HsmError {
    move |e| HsmError::device(step, e.to_string())
}

fn to_esys_public(public: &Tpm2bPublic) -> HsmResult<Public> {
    let mut area = Writer::new();
    public.public_area.marshal(&mut area)?;
    Public::unmarshall(&area.into_bytes())
        .map_err(|e| HsmError::Codec(format!("public area rejected by ESAPI: {}", e)))
}

fn from_esys_public(public: &Public) -> HsmResult<Tpm2bPublic> {
    let bytes = public
        .marshall()
        .map_err(|e| HsmError::Codec(format!("public area marshal failed: {}", e)))?;
    let mut cursor = Cursor::new(&bytes);
    Ok(Tpm2bPublic::new(TpmtPublic::unmarshal(&mut cursor, true)?))
}

impl EsapiTpm {
    /// Open a context from `tcti`, the `TPM2TOOLS_TCTI` environment, or the
    /// kernel resource manager, in that order.
    pub fn open(tcti: Option<&str>) -> HsmResult<Self> {
        let conf = match tcti {
            Some(conf) => TctiNameConf::from_str(conf).map_err(failed(TpmStep::Open))?,
            None => TctiNameConf::from_environment_variable().or_else(|_| {
                DeviceConfig::from_str("/dev/tpmrm0")
                    .map(TctiNameConf::Device)
                    .map_err(failed(TpmStep::Open))
            })?,
        };
        let context = Context::new(conf).map_err(failed(TpmStep::Open))?;
        info!("EsapiTpm :: Context :: OPEN");
        Ok(Self {
            context,
            transient: HashMap::new(),
            sessions: HashMap::new(),
            next_id: TRANSIENT_FIRST,
            next_session: POLICY_SESSION_FIRST,
        })
    }

    fn resolve(&mut self, handle: ObjectHandle, step: TpmStep) -> HsmResult<EsysHandle> {
        if handle.is_persistent() {
            let persistent = PersistentTpmHandle::new(handle.0).map_err(failed(step))?;
            self.context
                .tr_from_tpm_public(TpmHandle::Persistent(persistent))
                .map_err(failed(step))
        } else {
            self.transient
                .get(&handle.0)
                .copied()
                .ok_or_else(|| HsmError::device(step, format!("unknown handle 0x{:08x}", handle.0)))
        }
    }

    fn track(&mut self, handle: EsysHandle) -> ObjectHandle {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(TRANSIENT_FIRST);
        self.transient.insert(id, handle);
        ObjectHandle(id)
    }
}

impl TpmDevice for EsapiTpm {
    fn read_public(&mut self, handle: ObjectHandle) -> HsmResult<Tpm2bPublic> {
        let esys = self.resolve(handle, TpmStep::ReadPublic)?;
        let (public, _, _) = self
            .context
            .read_public(KeyHandle::from(esys))
            .map_err(failed(TpmStep::ReadPublic))?;
        from_esys_public(&public)
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &Tpm2bPublic,
    ) -> HsmResult<(ObjectHandle, Tpm2bPublic)> {
        let public = to_esys_public(template)?;
        let esys_hierarchy = match hierarchy {
            Hierarchy::Owner => EsysHierarchy::Owner,
            Hierarchy::Endorsement => EsysHierarchy::Endorsement,
        };
        let result = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create_primary(esys_hierarchy, public, None, None, None, None)
            })
            .map_err(failed(TpmStep::CreatePrimary))?;
        let out_public = from_esys_public(&result.out_public)?;
        Ok((self.track(result.key_handle.into()), out_public))
    }

    fn evict_control(&mut self, object: ObjectHandle, persistent: ObjectHandle) -> HsmResult<()> {
        let esys = self.resolve(object, TpmStep::EvictControl)?;
        let target = PersistentTpmHandle::new(persistent.0).map_err(failed(TpmStep::EvictControl))?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, esys, Persistent::Persistent(target))
            })
            .map_err(failed(TpmStep::EvictControl))?;
        Ok(())
    }

    fn start_policy_session(&mut self) -> HsmResult<SessionHandle> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(failed(TpmStep::StartPolicySession))?
            .ok_or_else(|| HsmError::device(TpmStep::StartPolicySession, "no session returned"))?;
        let policy = PolicySession::try_from(session).map_err(failed(TpmStep::StartPolicySession))?;
        let id = self.next_session;
        self.next_session = self.next_session.wrapping_add(1);
        self.sessions.insert(id, policy);
        Ok(SessionHandle(id))
    }

    fn policy_secret(&mut self, session: SessionHandle, auth: Hierarchy) -> HsmResult<()> {
        let policy = *self
            .sessions
            .get(&session.0)
            .ok_or_else(|| HsmError::device(TpmStep::PolicySecret, "unknown session"))?;
        let auth_handle = match auth {
            Hierarchy::Owner => AuthHandle::Owner,
            Hierarchy::Endorsement => AuthHandle::Endorsement,
        };
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.policy_secret(
                    policy,
                    auth_handle,
                    Nonce::default(),
                    Digest::default(),
                    Nonce::default(),
                    None,
                )
            })
            .map_err(failed(TpmStep::PolicySecret))?;
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
        let policy = self
            .sessions
            .remove(&session.0)
            .ok_or_else(|| HsmError::device(step, "unknown session"))?;
        let activate = KeyHandle::from(self.resolve(activate, step)?);
        let key = KeyHandle::from(self.resolve(key, step)?);
        let credential_blob = IdObject::try_from(id_object.to_vec()).map_err(failed(step))?;
        let secret = EncryptedSecret::try_from(encrypted_secret.to_vec()).map_err(failed(step))?;

        self.context.set_sessions((
            Some(AuthSession::Password),
            Some(AuthSession::PolicySession(policy)),
            None,
        ));
        let result = self
            .context
            .activate_credential(activate, key, credential_blob, secret);
        self.context.clear_sessions();
        Ok(result.map_err(failed(step))?.value().to_vec())
    }

    fn import(
        &mut self,
        parent: ObjectHandle,
        encryption_key: &[u8],
        public: &Tpm2bPublic,
        duplicate: &[u8],
        in_sym_seed: &[u8],
        symmetric: SymDefObject,
    ) -> HsmResult<Vec<u8>> {
        let step = TpmStep::Import;
        let parent = self.resolve(parent, step)?;
        let encryption_key = Data::try_from(encryption_key.to_vec()).map_err(failed(step))?;
        let public = to_esys_public(public)?;
        let duplicate = Private::try_from(duplicate.to_vec()).map_err(failed(step))?;
        let seed = EncryptedSecret::try_from(in_sym_seed.to_vec()).map_err(failed(step))?;
        let symmetric = if symmetric == SymDefObject::NULL {
            SymmetricDefinitionObject::Null
        } else {
            SymmetricDefinitionObject::AES_128_CFB
        };

        let private = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.import(parent, Some(encryption_key), public, duplicate, seed, symmetric)
            })
            .map_err(failed(step))?;
        Ok(private.value().to_vec())
    }

    fn load(
        &mut self,
        parent: ObjectHandle,
        private: &[u8],
        public: &Tpm2bPublic,
    ) -> HsmResult<ObjectHandle> {
        let step = TpmStep::Load;
        let parent = KeyHandle::from(self.resolve(parent, step)?);
        let private = Private::try_from(private.to_vec()).map_err(failed(step))?;
        let public = to_esys_public(public)?;

        let loaded = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.load(parent, private, public)
            })
            .map_err(failed(step))?;
        Ok(self.track(loaded.into()))
    }

    fn flush_context(&mut self, handle: u32) -> HsmResult<()> {
        if let Some(policy) = self.sessions.remove(&handle) {
            let session = AuthSession::PolicySession(policy);
            return self
                .context
                .flush_context(EsysHandle::from(tss_esapi::handles::SessionHandle::from(session)))
                .map_err(failed(TpmStep::FlushContext));
        }
        let esys = self
            .transient
            .remove(&handle)
            .ok_or_else(|| HsmError::device(TpmStep::FlushContext, "unknown handle"))?;
        self.context
            .flush_context(esys)
            .map_err(failed(TpmStep::FlushContext))
    }

    fn hmac(&mut self, key: ObjectHandle, data: &[u8]) -> HsmResult<Vec<u8>> {
        let step = TpmStep::Hmac;
        let key = self.resolve(key, step)?;
        let buffer = MaxBuffer::try_from(data.to_vec()).map_err(failed(step))?;
        let digest = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.hmac(key, buffer, HashingAlgorithm::Sha256)
            })
            .map_err(failed(step))?;
        Ok(digest.value().to_vec())
    }

    fn input_buffer_size(&mut self) -> HsmResult<u32> {
        self.context
            .get_tpm_property(PropertyTag::InputBuffer)
            .map_err(failed(TpmStep::GetProperty))?
            .ok_or_else(|| HsmError::device(TpmStep::GetProperty, "TPM_PT_INPUT_BUFFER missing"))
    }
}
