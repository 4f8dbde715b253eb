//! Configuration management for iapt

mod settings;
pub mod serde_utils;

pub use settings::{AlgorithmPreferences, ConnectionSettings, IaptConfig, RelaySettings};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// `<platform config dir>/iapt`, or `./iapt` when the platform has none
pub fn default_config_dir() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("iapt")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Read and parse a TOML configuration file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(ConfigError::Invalid(format!("cannot read {:?}: {}", path, e))),
    };
    Ok(toml::from_str(&content)?)
}

/// Like [`load_config`], but a missing file yields `T::default()`
pub fn load_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    load_config(path).or_else(|e| match e {
        ConfigError::NotFound(_) => {
            tracing::debug!(?path, "no config file, using defaults");
            Ok(T::default())
        }
        other => Err(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let result: Result<ConnectionSettings, _> = load_config(&path);
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let settings: ConnectionSettings = load_or_default(&path).unwrap();
        assert_eq!(settings.ssh_port, 22);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "ssh_username = \"alice\"\n[relay]\naddress = \"10.0.0.1:443\"\n")
            .unwrap();

        let loaded: ConnectionSettings = load_or_default(&path).unwrap();
        assert_eq!(loaded.ssh_username.as_deref(), Some("alice"));
        assert_eq!(loaded.relay.address, "10.0.0.1:443");
        assert_eq!(loaded.ssh_port, 22);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "ssh_port = \"twenty-two\"").unwrap();
        let result: Result<ConnectionSettings, _> = load_config(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
