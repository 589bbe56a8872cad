//! Persistent Ed25519 identity of the station host

pub mod crypto;
mod keystore;

pub use keystore::{
    IdentityOptions, KeystoreError, Keypair, PRIVATE_KEY_LEN, PUBLIC_KEY_HEX_LEN, PUBLIC_KEY_LEN,
    get_or_create_identity,
};

use crate::config::Config;
use crate::paths::{IDENTITY_FILE_NAME, StatePaths};

impl IdentityOptions {
    pub fn from_config(config: &Config, paths: &StatePaths) -> Self {
        Self {
            secrets_dir: paths.secrets_dir(),
            file_name: IDENTITY_FILE_NAME.to_string(),
            passphrase: config.passphrase.clone(),
            recreate_on_error: config.recreate_station_id_on_error,
        }
    }
}
