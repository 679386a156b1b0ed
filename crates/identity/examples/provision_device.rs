//! Example: Device provisioning credentials
//!
//! Loads a DevAuth configuration, opens the configured backend and prints
//! the registration id together with the credential the device would
//! present to the provisioning service.
//!
//! Usage:
//! ```bash
//! cargo run --example provision_device -- devauth.toml "0ne00000000/registrations"
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use devauth_core::{logging, Config};
use devauth_identity::{HsmSystem, ProvAuthType, ProvisioningAuth};

fn main() -> anyhow::Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => Config::from_file(path)?,
        None => Config::default_config(),
    };
    let scope_prefix = args
        .next()
        .unwrap_or_else(|| "0ne00000000/registrations".to_string());

    let system = HsmSystem::from_config(&config)?;
    let mut auth = ProvisioningAuth::create(&system)?;
    let registration_id = auth.registration_id()?;
    tracing::info!("Registration id: {}", registration_id);

    match auth.auth_type() {
        ProvAuthType::X509 => {
            println!("{}", auth.certificate()?);
        }
        ProvAuthType::Tpm | ProvAuthType::SymmetricKey => {
            let expiry = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + 3600;
            let scope = format!("{}/{}", scope_prefix, registration_id);
            match auth.construct_sas_token(&scope, None, expiry) {
                Ok(token) => println!("{}", token),
                // A TPM has no identity key until the service activates one.
                Err(e) => tracing::warn!("SAS token unavailable: {}", e),
            }
        }
    }

    auth.destroy();
    Ok(())
}
