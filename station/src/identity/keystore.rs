//! On-disk identity keystore
//!
//! The keypair is stored as JSON `{publicKey, privateKey}` with both keys
//! hex-encoded DER (SPKI for the public key, PKCS#8 for the private key).
//! With a passphrase the JSON is encrypted by [`super::crypto`]; without one it
//! is written as plaintext. A plaintext store found while a passphrase is
//! configured is re-encrypted in place.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::crypto::{self, CryptoError};

/// DER prefix of an Ed25519 SubjectPublicKeyInfo; followed by the 32-byte key
const SPKI_PREFIX: [u8; 12] = [0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];

/// DER prefix of an Ed25519 PKCS#8 PrivateKeyInfo; followed by the 32-byte seed
const PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

pub const PUBLIC_KEY_LEN: usize = SPKI_PREFIX.len() + 32;
pub const PRIVATE_KEY_LEN: usize = PKCS8_PREFIX.len() + 32;

/// Length of [`Keypair::public_key_hex`]; downstream validation depends on it
pub const PUBLIC_KEY_HEX_LEN: usize = PUBLIC_KEY_LEN * 2;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("identity store {path} is corrupted ({reason}); restart with --recreate-station-id-on-error to generate a new identity")]
    Corrupted { path: PathBuf, reason: String },

    #[error(
        "cannot decrypt identity store {path}: wrong passphrase or corrupted file; restart with --recreate-station-id-on-error to replace it with a new identity (the old one is lost)"
    )]
    WrongPassphrase { path: PathBuf },

    #[error("identity store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl KeystoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why a stored keypair could not be used
#[derive(Debug, Error)]
enum InvalidKeypair {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hex in {field}: {source}")]
    Hex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("{0}")]
    Malformed(&'static str),
}

/// Ed25519 signing identity of this host
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    /// SPKI DER encoding
    public_key: Vec<u8>,
    /// PKCS#8 DER encoding
    private_key: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeypair {
    public_key: String,
    private_key: String,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);

        let mut public_key = Vec::with_capacity(PUBLIC_KEY_LEN);
        public_key.extend_from_slice(&SPKI_PREFIX);
        public_key.extend_from_slice(signing.verifying_key().as_bytes());

        let mut private_key = Vec::with_capacity(PRIVATE_KEY_LEN);
        private_key.extend_from_slice(&PKCS8_PREFIX);
        private_key.extend_from_slice(seed);

        Self {
            public_key,
            private_key,
        }
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Hex SPKI encoding passed to modules as the station id
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    pub fn signing_key(&self) -> SigningKey {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&self.private_key[PKCS8_PREFIX.len()..]);
        SigningKey::from_bytes(&seed)
    }

    fn to_json(&self) -> Vec<u8> {
        let stored = StoredKeypair {
            public_key: hex::encode(&self.public_key),
            private_key: hex::encode(&self.private_key),
        };
        // Serializing two strings cannot fail
        serde_json::to_vec(&stored).unwrap_or_default()
    }

    fn from_json(bytes: &[u8]) -> Result<Self, InvalidKeypair> {
        let stored: StoredKeypair = serde_json::from_slice(bytes)?;
        let public_key = hex::decode(stored.public_key.trim()).map_err(|source| InvalidKeypair::Hex {
            field: "publicKey",
            source,
        })?;
        let private_key = hex::decode(stored.private_key.trim()).map_err(|source| InvalidKeypair::Hex {
            field: "privateKey",
            source,
        })?;

        if public_key.len() != PUBLIC_KEY_LEN || !public_key.starts_with(&SPKI_PREFIX) {
            return Err(InvalidKeypair::Malformed("publicKey is not an Ed25519 SPKI key"));
        }
        if private_key.len() != PRIVATE_KEY_LEN || !private_key.starts_with(&PKCS8_PREFIX) {
            return Err(InvalidKeypair::Malformed("privateKey is not an Ed25519 PKCS#8 key"));
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&private_key[PKCS8_PREFIX.len()..]);
        let derived = Self::from_seed(&seed);
        if derived.public_key != public_key {
            return Err(InvalidKeypair::Malformed("publicKey does not match privateKey"));
        }
        Ok(derived)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct IdentityOptions {
    pub secrets_dir: PathBuf,
    pub file_name: String,
    pub passphrase: Option<String>,
    pub recreate_on_error: bool,
}

impl IdentityOptions {
    pub fn path(&self) -> PathBuf {
        self.secrets_dir.join(&self.file_name)
    }
}

/// Load the host identity, creating or upgrading the store as needed
pub fn get_or_create_identity(options: &IdentityOptions) -> Result<Keypair, KeystoreError> {
    let path = options.path();
    let passphrase = options.passphrase.as_deref().filter(|p| !p.is_empty());
    debug!(path = %path.display(), encrypted = passphrase.is_some(), "get_or_create_identity: called");

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Creating new station identity");
            let keypair = Keypair::generate();
            store(&path, &keypair, passphrase)?;
            return Ok(keypair);
        }
        Err(e) => return Err(KeystoreError::io(&path, e)),
    };

    let result = match passphrase {
        None => Keypair::from_json(&bytes).map_err(|e| KeystoreError::Corrupted {
            path: path.clone(),
            reason: e.to_string(),
        }),
        Some(passphrase) if crypto::looks_like_plaintext_json(&bytes) => match Keypair::from_json(&bytes) {
            Ok(keypair) => {
                info!(path = %path.display(), "Encrypting plaintext station identity");
                store(&path, &keypair, Some(passphrase))?;
                Ok(keypair)
            }
            Err(e) => Err(KeystoreError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            }),
        },
        Some(passphrase) => open_encrypted(&path, &bytes, passphrase),
    };

    match result {
        Ok(keypair) => Ok(keypair),
        Err(KeystoreError::Io { path, source }) => Err(KeystoreError::Io { path, source }),
        Err(e) if options.recreate_on_error => {
            warn!(path = %path.display(), error = %e, "Replacing unreadable station identity");
            let keypair = Keypair::generate();
            store(&path, &keypair, passphrase)?;
            Ok(keypair)
        }
        Err(e) => Err(e),
    }
}

fn open_encrypted(path: &Path, bytes: &[u8], passphrase: &str) -> Result<Keypair, KeystoreError> {
    let plaintext = crypto::decrypt(passphrase, bytes).map_err(|e| {
        debug!(error = %e, "open_encrypted: decryption failed");
        KeystoreError::WrongPassphrase {
            path: path.to_path_buf(),
        }
    })?;
    Keypair::from_json(&plaintext).map_err(|e| {
        debug!(error = %e, "open_encrypted: decrypted store is not a keypair");
        KeystoreError::WrongPassphrase {
            path: path.to_path_buf(),
        }
    })
}

fn store(path: &Path, keypair: &Keypair, passphrase: Option<&str>) -> Result<(), KeystoreError> {
    let json = keypair.to_json();
    let bytes = match passphrase {
        Some(passphrase) => crypto::encrypt(passphrase, &json).map_err(|e: CryptoError| {
            KeystoreError::io(path, io::Error::other(e))
        })?,
        None => json,
    };
    write_private(path, &bytes).map_err(|e| KeystoreError::io(path, e))
}

/// Write through a sibling temp file so a crash never leaves a half-written store
fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    set_permission_0600(&tmp)?;
    fs::rename(&tmp, path)
}

#[cfg(unix)]
fn set_permission_0600(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_permission_0600(_path: &Path) -> io::Result<()> {
    Ok(())
}
