//! Process-scoped backend selection.
//!
//! An [`HsmSystem`] is built once at startup from configuration (or from a
//! caller supplied [`HsmFactory`]) and hands out backend contexts to the
//! provisioning and hub facades. State that must outlive a single context
//! lives in the factory: the stub TPM, the static X.509 store and the RIoT
//! root key.

use std::sync::Arc;

use p256::SecretKey;
use rand::rngs::OsRng;
use tracing::{error, info};

use devauth_core::{Config, EdgeConfig, RiotConfig, SymmetricKeyConfig, TpmConfig};

use crate::backend::{BackendKind, HsmFactory, HsmHandle};
use crate::edge::EdgeClient;
use crate::error::{HsmError, HsmResult};
use crate::riot::RiotIdentity;
use crate::symmetric::SymmetricKeyStore;
use crate::tpm::{self, SoftwareTpm, TpmProvisioner};
use crate::x509::{StaticX509, X509Store};

/// Credential type an IoT hub client authenticates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IotHubSecurityType {
    Sas,
    X509,
    HttpEdge,
    SymmetricKey,
}

impl IotHubSecurityType {
    /// Whether a device of `kind` can produce this credential type.
    pub fn accepts(self, kind: BackendKind) -> bool {
        match self {
            IotHubSecurityType::Sas => kind == BackendKind::Tpm,
            IotHubSecurityType::X509 => kind.is_x509(),
            IotHubSecurityType::HttpEdge => kind == BackendKind::HttpEdge,
            IotHubSecurityType::SymmetricKey => kind == BackendKind::SymmetricKey,
        }
    }
}

/// TPM contexts over hardware or a shared software TPM.
pub struct TpmFactory {
    config: TpmConfig,
    stub: SoftwareTpm,
}

impl TpmFactory {
    pub fn new(config: TpmConfig) -> Self {
        Self::with_stub(config, SoftwareTpm::new())
    }

    /// Use `stub` whenever hardware is not selected.
    pub fn with_stub(config: TpmConfig, stub: SoftwareTpm) -> Self {
        Self { config, stub }
    }
}

impl HsmFactory for TpmFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Tpm
    }

    fn create(&self) -> HsmResult<HsmHandle> {
        let device = tpm::open_device(&self.config, &self.stub)?;
        Ok(HsmHandle::Tpm(Box::new(TpmProvisioner::create(device)?)))
    }
}

/// Contexts over one process-wide [`X509Store`].
pub struct X509Factory {
    store: Arc<X509Store>,
}

impl X509Factory {
    pub fn new(store: Arc<X509Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<X509Store> {
        Arc::clone(&self.store)
    }
}

impl HsmFactory for X509Factory {
    fn kind(&self) -> BackendKind {
        BackendKind::X509Static
    }

    fn create(&self) -> HsmResult<HsmHandle> {
        Ok(HsmHandle::X509(Box::new(StaticX509::new(self.store()))))
    }
}

/// RIoT contexts sharing one root key for the life of the process.
pub struct RiotFactory {
    config: RiotConfig,
    root_key: SecretKey,
}

impl RiotFactory {
    pub fn new(config: RiotConfig) -> Self {
        Self::with_root_key(config, SecretKey::random(&mut OsRng))
    }

    pub fn with_root_key(config: RiotConfig, root_key: SecretKey) -> Self {
        Self { config, root_key }
    }
}

impl HsmFactory for RiotFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::X509Riot
    }

    fn create(&self) -> HsmResult<HsmHandle> {
        let identity = RiotIdentity::with_root_key(&self.config, self.root_key.clone())?;
        Ok(HsmHandle::X509(Box::new(identity)))
    }
}

pub struct SymmetricKeyFactory {
    config: SymmetricKeyConfig,
}

impl SymmetricKeyFactory {
    pub fn new(config: SymmetricKeyConfig) -> Self {
        Self { config }
    }
}

impl HsmFactory for SymmetricKeyFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::SymmetricKey
    }

    fn create(&self) -> HsmResult<HsmHandle> {
        Ok(HsmHandle::SymmetricKey(Box::new(
            SymmetricKeyStore::from_config(&self.config)?,
        )))
    }
}

/// Edge contexts configured from the `IOTEDGE_*` environment.
pub struct EdgeFactory {
    config: EdgeConfig,
}

impl EdgeFactory {
    pub fn new(config: EdgeConfig) -> Self {
        Self { config }
    }
}

impl HsmFactory for EdgeFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::HttpEdge
    }

    fn create(&self) -> HsmResult<HsmHandle> {
        Ok(HsmHandle::HttpEdge(Box::new(EdgeClient::from_env(&self.config)?)))
    }
}

/// Backend selection for the lifetime of the process.
pub struct HsmSystem {
    factory: Box<dyn HsmFactory>,
    x509_store: Option<Arc<X509Store>>,
}

impl HsmSystem {
    pub fn new(factory: Box<dyn HsmFactory>) -> Self {
        info!("STATUS: HsmSystem :: {} backend :: INITIALIZED", factory.kind());
        Self {
            factory,
            x509_store: None,
        }
    }

    /// Wire the factory for `config.security.device_type`.
    pub fn from_config(config: &Config) -> HsmResult<Self> {
        config.validate()?;
        let kind = BackendKind::from_device_type(config.security.device_type);
        let system = match kind {
            BackendKind::Tpm => Self::new(Box::new(TpmFactory::new(config.tpm.clone()))),
            BackendKind::X509Static => {
                let factory = X509Factory::new(Arc::new(X509Store::new()));
                let store = factory.store();
                let mut system = Self::new(Box::new(factory));
                system.x509_store = Some(store);
                system
            }
            BackendKind::X509Riot => Self::new(Box::new(RiotFactory::new(config.riot.clone()))),
            BackendKind::SymmetricKey => Self::new(Box::new(SymmetricKeyFactory::new(
                config.symmetric_key.clone(),
            ))),
            BackendKind::HttpEdge => Self::new(Box::new(EdgeFactory::new(config.edge.clone()))),
        };
        Ok(system)
    }

    pub fn kind(&self) -> BackendKind {
        self.factory.kind()
    }

    /// Store written by provisioning tooling when the device is X.509 static.
    pub fn x509_store(&self) -> Option<Arc<X509Store>> {
        self.x509_store.clone()
    }

    /// Fail unless the configured device can serve `security_type`.
    pub fn ensure_hub_security(&self, security_type: IotHubSecurityType) -> HsmResult<()> {
        if security_type.accepts(self.kind()) {
            return Ok(());
        }
        error!(
            "HsmSystem :: {:?} hub security with {} device :: MISMATCH",
            security_type,
            self.kind()
        );
        Err(HsmError::ProtocolSequence(format!(
            "{:?} hub security is incompatible with {} device",
            security_type,
            self.kind()
        )))
    }

    /// Create a backend context; its capability set must match the kind.
    pub fn create_handle(&self) -> HsmResult<HsmHandle> {
        let handle = self.factory.create()?;
        if !handle.satisfies(self.kind()) {
            return Err(HsmError::ProtocolSequence(format!(
                "{} factory produced a {} handle",
                self.kind(),
                handle.capability_name()
            )));
        }
        Ok(handle)
    }
}

impl Drop for HsmSystem {
    fn drop(&mut self) {
        info!("STATUS: HsmSystem :: {} backend :: DEINITIALIZED", self.kind());
    }
}

impl std::fmt::Debug for HsmSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmSystem")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}
