//! iapt-core: Core types, errors and configuration for iapt
//!
//! This crate provides the domain types, error taxonomy and configuration
//! structures shared by the tunnel broker, the SSH transport and the
//! connection orchestrator.

pub mod config;
pub mod error;
pub mod help;
pub mod time;
pub mod types;

pub use error::{ConfigError, ConnectError};
pub use help::HelpTopic;
pub use types::{
    AlgorithmCategory, AuthorizeKeyMethod, AuthorizeKeyMethods, Destination, InstanceLocator,
    ResourceNode, SessionState, TunnelState,
};
