//! Config command implementations

use std::path::Path;

use anyhow::{Context, Result};

use iapt_core::config::{self, IaptConfig};

use crate::output::{print_error, print_info, print_success, print_warning};

/// Print a value of the effective configuration by dotted key
///
/// Keys missing from the file resolve to their defaults.
pub fn config_get(config: &IaptConfig, key: &str) -> Result<()> {
    let root = toml::Value::try_from(config).context("Failed to serialize configuration")?;

    let mut current = &root;
    for part in key.split('.') {
        current = match current {
            toml::Value::Table(table) => table
                .get(part)
                .ok_or_else(|| anyhow::anyhow!("Key not found: {}", key))?,
            _ => anyhow::bail!("Key not found: {}", key),
        };
    }

    match current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(current)?),
        toml::Value::Array(items) => {
            for item in items {
                match item {
                    toml::Value::String(s) => println!("{}", s),
                    other => println!("{}", other),
                }
            }
        }
        other => println!("{}", other),
    }

    Ok(())
}

/// Show the configuration file, or the defaults if there is none
pub fn config_show(path: &Path) -> Result<()> {
    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 'iapt config init' to create one. Defaults in effect:");
        println!();
        println!("{}", toml::to_string_pretty(&IaptConfig::default())?);
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Write the default configuration file
pub fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}

/// Print where the configuration is read from
pub fn config_path(path: Option<&Path>) {
    match path {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", config::default_config_path().display()),
    }
}

const DEFAULT_CONFIG: &str = r#"# iapt configuration

# Account keys are published for. Defaults to <user>@localhost.
# account = "you@example.com"

# authorized_keys file key publication writes to.
# Defaults to authorized_keys next to this file's default location.
# authorized_keys = "/home/you/.ssh/authorized_keys"

# Private key to use instead of a fresh Ed25519 key per connection
# identity_file = "/home/you/.ssh/id_ed25519"

[connection]
ssh_port = 22
# ssh_username = "you"

# Seconds allowed for tunnel, key publication and handshake together
connection_timeout = 30

# Days a published key stays valid
key_validity = 30

# Key publication methods: 1 = metadata, 2 = OS Login, 3 = both
authorize_methods = 3

# Preferred algorithms per category; empty keeps the library order
[connection.algorithms]
kex = []
host_key = []
cipher = []
mac = []
compression = []

[connection.relay]
address = "127.0.0.1:8022"

# Seconds an unused tunnel stays open
idle_timeout = 60
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_template_matches_defaults() {
        let parsed: IaptConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        let defaults = IaptConfig::default();

        assert_eq!(parsed.account, defaults.account);
        assert_eq!(parsed.connection.ssh_port, defaults.connection.ssh_port);
        assert_eq!(parsed.connection.connection_timeout, Duration::from_secs(30));
        assert_eq!(parsed.connection.key_validity, defaults.connection.key_validity);
        assert_eq!(
            parsed.connection.authorize_methods,
            defaults.connection.authorize_methods
        );
        assert_eq!(parsed.connection.algorithms, defaults.connection.algorithms);
        assert_eq!(parsed.connection.relay.address, defaults.connection.relay.address);
    }

    #[test]
    fn test_get_unknown_key_fails() {
        let config = IaptConfig::default();
        assert!(config_get(&config, "connection.nope").is_err());
        assert!(config_get(&config, "connection.ssh_port.deeper").is_err());
        assert!(config_get(&config, "connection.relay").is_ok());
    }
}
