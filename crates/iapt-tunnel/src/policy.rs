//! Relay policies
//!
//! A policy decides whether an inbound connection on a tunnel's local
//! endpoint may use the tunnel. Policies are evaluated concurrently for
//! different tunnels and hold no mutable state.

use std::net::SocketAddr;

/// Description of an inbound local connection attempt
#[derive(Debug, Clone)]
pub struct IncomingConnection {
    /// Address of the connecting socket
    pub peer: SocketAddr,
    /// Tunnel endpoint the peer connected to
    pub local: SocketAddr,
    /// PID of the process owning the peer socket, if it could be determined
    pub owner_pid: Option<u32>,
    /// Connections currently relayed by the tunnel
    pub active_connections: usize,
}

/// Outcome of evaluating a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDecision {
    pub allow: bool,
    pub reason: String,
}

impl RelayDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

/// Decides which local connections may use a tunnel
pub trait RelayPolicy: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Accept or reject an inbound connection
    fn evaluate(&self, incoming: &IncomingConnection) -> RelayDecision;
}

/// Admits a single connection, and only from the broker's own process
#[derive(Debug, Clone)]
pub struct SameProcessPolicy {
    pid: u32,
}

impl SameProcessPolicy {
    /// Policy for the current process
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
        }
    }

    /// Policy for an explicit process ID
    pub fn for_pid(pid: u32) -> Self {
        Self { pid }
    }
}

impl Default for SameProcessPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayPolicy for SameProcessPolicy {
    fn name(&self) -> &'static str {
        "same-process"
    }

    fn evaluate(&self, incoming: &IncomingConnection) -> RelayDecision {
        match incoming.owner_pid {
            None => RelayDecision::deny("owning process of the peer socket is unknown"),
            Some(pid) if pid != self.pid => {
                RelayDecision::deny(format!("connection from foreign process {}", pid))
            }
            Some(_) if incoming.active_connections > 0 => {
                RelayDecision::deny("tunnel is already in use by another connection")
            }
            Some(_) => RelayDecision::allow("connection from own process"),
        }
    }
}

/// Admits every connection
#[derive(Debug, Clone, Default)]
pub struct AllowAllPolicy;

impl RelayPolicy for AllowAllPolicy {
    fn name(&self) -> &'static str {
        "allow-all"
    }

    fn evaluate(&self, _incoming: &IncomingConnection) -> RelayDecision {
        RelayDecision::allow("all connections allowed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(owner_pid: Option<u32>, active_connections: usize) -> IncomingConnection {
        IncomingConnection {
            peer: "127.0.0.1:50000".parse().unwrap(),
            local: "127.0.0.1:40000".parse().unwrap(),
            owner_pid,
            active_connections,
        }
    }

    #[test]
    fn test_same_process_admits_own_process() {
        let policy = SameProcessPolicy::for_pid(100);
        assert!(policy.evaluate(&incoming(Some(100), 0)).allow);
    }

    #[test]
    fn test_same_process_rejects_foreign_process() {
        let policy = SameProcessPolicy::for_pid(100);
        let decision = policy.evaluate(&incoming(Some(200), 0));
        assert!(!decision.allow);
        assert!(decision.reason.contains("200"));
    }

    #[test]
    fn test_same_process_rejects_unknown_owner() {
        let policy = SameProcessPolicy::for_pid(100);
        assert!(!policy.evaluate(&incoming(None, 0)).allow);
    }

    #[test]
    fn test_same_process_rejects_second_connection() {
        let policy = SameProcessPolicy::for_pid(100);
        let decision = policy.evaluate(&incoming(Some(100), 1));
        assert!(!decision.allow);
        assert!(decision.reason.contains("in use"));
    }

    #[test]
    fn test_default_uses_current_process() {
        let policy = SameProcessPolicy::default();
        assert!(policy.evaluate(&incoming(Some(std::process::id()), 0)).allow);
    }

    #[test]
    fn test_allow_all() {
        let policy = AllowAllPolicy;
        assert!(policy.evaluate(&incoming(None, 5)).allow);
        assert_eq!(policy.name(), "allow-all");
    }

    #[test]
    fn test_policies_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SameProcessPolicy>();
        assert_send_sync::<AllowAllPolicy>();
    }
}
