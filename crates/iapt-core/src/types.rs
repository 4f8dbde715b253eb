//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Fully qualified reference to a VM instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceLocator {
    /// Project ID
    pub project: String,
    /// Zone the instance lives in
    pub zone: String,
    /// Instance name
    pub name: String,
}

impl InstanceLocator {
    /// Create a new instance locator
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}",
            self.project, self.zone, self.name
        )
    }
}

/// What a tunnel or session connects to: an instance and a port on it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Target instance
    pub instance: InstanceLocator,
    /// Target port on the instance
    pub port: u16,
}

impl Destination {
    /// Create a new destination
    pub fn new(instance: InstanceLocator, port: u16) -> Self {
        Self { instance, port }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.port)
    }
}

/// A node of the resource inventory as seen by the presentation layer
///
/// Only instances can be connected to; zones and projects resolve to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceNode {
    /// A VM instance
    Instance(InstanceLocator),
    /// A zone within a project
    Zone { project: String, zone: String },
    /// A project
    Project { project: String },
}

impl ResourceNode {
    /// Resolve the node to a connection target on the given port
    pub fn connection_target(&self, port: u16) -> Option<Destination> {
        match self {
            ResourceNode::Instance(instance) => Some(Destination::new(instance.clone(), port)),
            ResourceNode::Zone { .. } | ResourceNode::Project { .. } => None,
        }
    }

    /// Human-readable name of the node
    pub fn display_name(&self) -> &str {
        match self {
            ResourceNode::Instance(instance) => &instance.name,
            ResourceNode::Zone { zone, .. } => zone,
            ResourceNode::Project { project } => project,
        }
    }
}

/// Lifecycle state of a relay tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// Relay is being dialed
    Connecting,
    /// Local endpoint is accepting connections
    Open,
    /// Tunnel was closed cleanly
    Closed,
    /// Tunnel terminated because of an I/O error
    Failed,
}

impl TunnelState {
    /// Whether the tunnel has reached a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Open => write!(f, "open"),
            TunnelState::Closed => write!(f, "closed"),
            TunnelState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle state of a secure transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, no stream attached yet
    Unconnected,
    /// Version and algorithm negotiation in progress
    Negotiating,
    /// Handshake completed, not yet authenticated
    Connected,
    /// Authenticated and usable
    Authenticated,
    /// Released
    Closed,
    /// Protocol error; the session cannot be reused
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unconnected => write!(f, "unconnected"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// A single mechanism for registering a public key on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizeKeyMethod {
    /// Instance or project metadata `ssh-keys`
    Metadata,
    /// OS Login user profile
    OsLogin,
}

impl AuthorizeKeyMethod {
    fn bit(self) -> u8 {
        match self {
            AuthorizeKeyMethod::Metadata => 0b01,
            AuthorizeKeyMethod::OsLogin => 0b10,
        }
    }
}

impl fmt::Display for AuthorizeKeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorizeKeyMethod::Metadata => write!(f, "metadata"),
            AuthorizeKeyMethod::OsLogin => write!(f, "os-login"),
        }
    }
}

/// Bit mask of allowed key authorization methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizeKeyMethods(u8);

impl AuthorizeKeyMethods {
    /// No method allowed
    pub const NONE: Self = Self(0);
    /// Metadata-based authorization only
    pub const METADATA: Self = Self(0b01);
    /// OS Login only
    pub const OS_LOGIN: Self = Self(0b10);
    /// Every known method
    pub const ALL: Self = Self(0b11);

    /// Order in which methods are attempted
    const ORDER: [AuthorizeKeyMethod; 2] =
        [AuthorizeKeyMethod::Metadata, AuthorizeKeyMethod::OsLogin];

    /// Build a mask from raw bits, ignoring unknown bits
    pub fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether no method is allowed
    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// Whether the mask allows a method
    pub fn contains(self, method: AuthorizeKeyMethod) -> bool {
        self.0 & method.bit() != 0
    }

    /// Allowed methods in attempt order
    pub fn iter(self) -> impl Iterator<Item = AuthorizeKeyMethod> {
        Self::ORDER.into_iter().filter(move |m| self.contains(*m))
    }
}

impl BitOr for AuthorizeKeyMethods {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<AuthorizeKeyMethod> for AuthorizeKeyMethods {
    fn from(method: AuthorizeKeyMethod) -> Self {
        Self(method.bit())
    }
}

/// Category of algorithms negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmCategory {
    /// Key exchange
    Kex,
    /// Server host key
    HostKey,
    /// Symmetric cipher
    Cipher,
    /// Message authentication code
    Mac,
    /// Compression
    Compression,
}

impl AlgorithmCategory {
    /// Every category, in negotiation order
    pub const ALL: [AlgorithmCategory; 5] = [
        AlgorithmCategory::Kex,
        AlgorithmCategory::HostKey,
        AlgorithmCategory::Cipher,
        AlgorithmCategory::Mac,
        AlgorithmCategory::Compression,
    ];
}

impl fmt::Display for AlgorithmCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmCategory::Kex => write!(f, "kex"),
            AlgorithmCategory::HostKey => write!(f, "host-key"),
            AlgorithmCategory::Cipher => write!(f, "cipher"),
            AlgorithmCategory::Mac => write!(f, "mac"),
            AlgorithmCategory::Compression => write!(f, "compression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceLocator {
        InstanceLocator::new("my-project", "us-central1-a", "instance-123")
    }

    #[test]
    fn test_destination_equality_by_instance_and_port() {
        let a = Destination::new(instance(), 22);
        let b = Destination::new(instance(), 22);
        let c = Destination::new(instance(), 3389);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_destination_display() {
        let d = Destination::new(instance(), 22);
        assert_eq!(
            d.to_string(),
            "projects/my-project/zones/us-central1-a/instances/instance-123:22"
        );
    }

    #[test]
    fn test_only_instances_resolve_to_targets() {
        let node = ResourceNode::Instance(instance());
        assert_eq!(
            node.connection_target(22),
            Some(Destination::new(instance(), 22))
        );

        let zone = ResourceNode::Zone {
            project: "my-project".into(),
            zone: "us-central1-a".into(),
        };
        assert!(zone.connection_target(22).is_none());
        assert!(ResourceNode::Project {
            project: "my-project".into()
        }
        .connection_target(22)
        .is_none());
    }

    #[test]
    fn test_method_mask_order_and_membership() {
        let all: Vec<_> = AuthorizeKeyMethods::ALL.iter().collect();
        assert_eq!(
            all,
            vec![AuthorizeKeyMethod::Metadata, AuthorizeKeyMethod::OsLogin]
        );

        let oslogin: Vec<_> = AuthorizeKeyMethods::OS_LOGIN.iter().collect();
        assert_eq!(oslogin, vec![AuthorizeKeyMethod::OsLogin]);

        assert!(AuthorizeKeyMethods::NONE.is_empty());
        assert_eq!(AuthorizeKeyMethods::NONE.iter().count(), 0);
        assert_eq!(
            AuthorizeKeyMethods::METADATA | AuthorizeKeyMethods::OS_LOGIN,
            AuthorizeKeyMethods::ALL
        );
        assert_eq!(AuthorizeKeyMethods::from_bits_truncate(0xff), AuthorizeKeyMethods::ALL);
    }

    #[test]
    fn test_tunnel_state_terminal() {
        assert!(!TunnelState::Open.is_terminal());
        assert!(TunnelState::Closed.is_terminal());
        assert!(TunnelState::Failed.is_terminal());
        assert_eq!(format!("{}", TunnelState::Connecting), "connecting");
    }
}
