//! Private key material handed to a session
//!
//! An `SshKey` is moved into `SecureTransportSession::authenticate`, which
//! owns and drops it. The type is deliberately not `Clone`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors producing key material
#[derive(Error, Debug)]
pub enum KeyError {
    /// Key generation failed
    #[error("Failed to generate {0} key")]
    Generate(&'static str),

    /// Loading a key from disk failed
    #[error("Failed to load key from {path}: {reason}")]
    Load { path: String, reason: String },

    /// The public half could not be derived
    #[error("Failed to derive public key: {0}")]
    Public(String),
}

/// A private key together with its public encoding
pub struct SshKey {
    pair: KeyPair,
    algorithm: &'static str,
    public_base64: String,
    fingerprint: String,
    id: String,
}

impl SshKey {
    /// Generate a new Ed25519 key
    pub fn generate_ed25519() -> Result<Self, KeyError> {
        let pair = KeyPair::generate_ed25519().ok_or(KeyError::Generate("ed25519"))?;
        Self::from_keypair(pair)
    }

    /// Load an unencrypted OpenSSH private key
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let pair = russh_keys::load_secret_key(path, None).map_err(|e| KeyError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_keypair(pair)
    }

    pub fn from_keypair(pair: KeyPair) -> Result<Self, KeyError> {
        let public = pair
            .clone_public_key()
            .map_err(|e| KeyError::Public(e.to_string()))?;
        let public_base64 = public.public_key_base64();
        let id = hex::encode(Sha256::digest(public_base64.as_bytes()));

        Ok(Self {
            algorithm: public.name(),
            fingerprint: public.fingerprint(),
            public_base64,
            id,
            pair,
        })
    }

    /// Key algorithm name, e.g. `ssh-ed25519`
    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    /// Base64 public key blob
    pub fn public_key_base64(&self) -> &str {
        &self.public_base64
    }

    /// Public key in `authorized_keys` format
    pub fn public_key_openssh(&self) -> String {
        format!("{} {}", self.algorithm, self.public_base64)
    }

    /// SHA-256 fingerprint as shown by OpenSSH
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Hex SHA-256 of the public key, stable for a given key
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Give up the private half for one authentication attempt
    pub(crate) fn into_keypair(self) -> Arc<KeyPair> {
        Arc::new(self.pair)
    }
}

impl fmt::Debug for SshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKey")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
