//! Device identity and authentication for DevAuth.
//!
//! This crate turns a device's secret store into the credentials a cloud
//! provisioning service and an IoT hub expect: TPM-attested SAS tokens,
//! RIoT/DICE derived certificate chains, pre-provisioned X.509 material,
//! symmetric keys, or signatures delegated to an edge runtime.
//!
//! # Core Concepts
//!
//! - **Backend**: One secret store variant, exposed through a capability
//!   trait ([`TpmHsm`], [`X509Hsm`], [`KeyHsm`], [`EdgeHsm`])
//! - **HsmSystem**: Process-scoped backend selection, made once at startup
//! - **Credential Activation**: TPM import of a service-wrapped identity key
//! - **Facades**: [`ProvisioningAuth`] and [`HubAuth`] present one API over
//!   whichever backend is configured
//!
//! # Security Model
//!
//! - Private key material never leaves a TPM backend; only HMACs do
//! - Activation blobs are fully validated before the first TPM command
//! - Derived secrets and keys are zeroized on drop
//! - Operations a backend does not offer fail instead of degrading
//!
//! # Example
//!
//! ```no_run
//! use devauth_core::Config;
//! use devauth_identity::{HsmSystem, ProvisioningAuth};
//!
//! let config = Config::from_file("devauth.toml")?;
//! let system = HsmSystem::from_config(&config)?;
//! let mut auth = ProvisioningAuth::create(&system)?;
//! println!("registration id: {}", auth.registration_id()?);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod backend;
pub mod edge;
pub mod error;
pub mod hub;
pub mod provisioning;
pub mod riot;
pub mod sas;
pub mod symmetric;
pub mod system;
pub mod tpm;
pub mod x509;

pub use backend::{BackendKind, EdgeHsm, HsmFactory, HsmHandle, KeyHsm, TpmHsm, X509Hsm};
pub use edge::EdgeClient;
pub use error::{HsmError, HsmResult, TpmStep};
pub use hub::{CredentialKind, CredentialRequest, CredentialResult, HubAuth, HubAuthType};
pub use provisioning::{tpm_registration_id, ProvAuthType, ProvisioningAuth};
pub use riot::RiotIdentity;
pub use symmetric::SymmetricKeyStore;
pub use system::{
    EdgeFactory, HsmSystem, IotHubSecurityType, RiotFactory, SymmetricKeyFactory, TpmFactory,
    X509Factory,
};
pub use tpm::{SoftwareTpm, TpmDevice, TpmProvisioner};
pub use x509::{StaticX509, X509Store};
