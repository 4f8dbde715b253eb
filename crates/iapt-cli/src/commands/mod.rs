//! CLI command implementations

mod algorithms;
mod config;
mod connect;
mod tunnel;

pub use algorithms::algorithms_command;
pub use config::{config_get, config_init, config_path, config_show};
pub use connect::{connect_command, ConnectOptions};
pub use tunnel::tunnel_command;
