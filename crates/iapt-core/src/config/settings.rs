//! Connection settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_days, duration_secs};
use crate::types::{AlgorithmCategory, AuthorizeKeyMethods};

/// Contents of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IaptConfig {
    /// Account keys are published for, as an email address
    pub account: Option<String>,

    /// `authorized_keys` file that key publication writes to
    pub authorized_keys: Option<PathBuf>,

    /// Private key to authenticate with instead of a fresh one per connection
    pub identity_file: Option<PathBuf>,

    pub connection: ConnectionSettings,
}

/// Settings consumed when connecting to an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// SSH port on the instance
    pub ssh_port: u16,

    /// Username to log in as; derived from the account when unset
    pub ssh_username: Option<String>,

    /// Budget for opening the tunnel, publishing the key and the handshake
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,

    /// How long a published key stays valid
    #[serde(with = "duration_days")]
    pub key_validity: Duration,

    /// Allowed key authorization methods
    pub authorize_methods: AuthorizeKeyMethods,

    /// Preferred algorithms per category (empty means library default)
    pub algorithms: AlgorithmPreferences,

    /// Relay settings
    pub relay: RelaySettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            ssh_username: None,
            connection_timeout: Duration::from_secs(30),
            key_validity: Duration::from_secs(30 * 24 * 60 * 60),
            authorize_methods: AuthorizeKeyMethods::ALL,
            algorithms: AlgorithmPreferences::default(),
            relay: RelaySettings::default(),
        }
    }
}

/// Ordered algorithm preferences, one list per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmPreferences {
    pub kex: Vec<String>,
    pub host_key: Vec<String>,
    pub cipher: Vec<String>,
    pub mac: Vec<String>,
    pub compression: Vec<String>,
}

impl AlgorithmPreferences {
    /// Preferences for one category
    pub fn get(&self, category: AlgorithmCategory) -> &[String] {
        match category {
            AlgorithmCategory::Kex => &self.kex,
            AlgorithmCategory::HostKey => &self.host_key,
            AlgorithmCategory::Cipher => &self.cipher,
            AlgorithmCategory::Mac => &self.mac,
            AlgorithmCategory::Compression => &self.compression,
        }
    }

    /// Replace the preferences for one category
    pub fn set(&mut self, category: AlgorithmCategory, names: Vec<String>) {
        match category {
            AlgorithmCategory::Kex => self.kex = names,
            AlgorithmCategory::HostKey => self.host_key = names,
            AlgorithmCategory::Cipher => self.cipher = names,
            AlgorithmCategory::Mac => self.mac = names,
            AlgorithmCategory::Compression => self.compression = names,
        }
    }

    /// Categories with a non-empty preference list
    pub fn configured(&self) -> impl Iterator<Item = (AlgorithmCategory, &[String])> {
        AlgorithmCategory::ALL
            .into_iter()
            .map(move |c| (c, self.get(c)))
            .filter(|(_, names)| !names.is_empty())
    }
}

/// Settings for reaching the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Relay endpoint address (host:port)
    pub address: String,

    /// Close a tunnel that has not admitted a local connection within this window
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8022".to_string(),
            idle_timeout: Duration::from_secs(60),
        }
    }
}
