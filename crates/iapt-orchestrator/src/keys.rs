//! Key providers

use std::path::PathBuf;

use iapt_ssh::{KeyError, SshKey};

/// Supplies the private key for one connection attempt
pub trait KeyProvider: Send + Sync {
    fn create_key(&self) -> Result<SshKey, KeyError>;
}

/// Generates a fresh Ed25519 key for every attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralKeyProvider;

impl KeyProvider for EphemeralKeyProvider {
    fn create_key(&self) -> Result<SshKey, KeyError> {
        SshKey::generate_ed25519()
    }
}

/// Loads an existing OpenSSH private key from disk
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyProvider for FileKeyProvider {
    fn create_key(&self) -> Result<SshKey, KeyError> {
        SshKey::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_keys_differ() {
        let a = EphemeralKeyProvider.create_key().unwrap();
        let b = EphemeralKeyProvider.create_key().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = FileKeyProvider::new(dir.path().join("id_ed25519"));
        assert!(matches!(provider.create_key(), Err(KeyError::Load { .. })));
    }
}
