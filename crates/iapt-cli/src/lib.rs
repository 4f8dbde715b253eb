//! iapt-cli: Command-line interface for iapt
//!
//! Provides the `iapt` binary for opening relay tunnels and SSH sessions
//! to VM instances.

pub mod commands;
pub mod output;
