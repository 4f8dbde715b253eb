//! Core error types for iapt

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::help::HelpTopic;
use crate::types::{AuthorizeKeyMethod, Destination, SessionState};

/// Tunnel-related errors
#[derive(Error, Debug, Clone)]
pub enum TunnelError {
    /// The relay could not be reached, or it could not reach the instance
    #[error("Relay unreachable for {destination}: {reason}")]
    RelayUnreachable {
        destination: Destination,
        reason: String,
    },

    /// The caller lacks permission to tunnel to the destination
    #[error("Not authorized to connect to {destination}: {reason}")]
    Unauthorized {
        destination: Destination,
        reason: String,
    },

    /// The relay policy denied an inbound local connection
    #[error("Connection from {peer} rejected by {policy} policy: {reason}")]
    PolicyRejected {
        peer: SocketAddr,
        policy: &'static str,
        reason: String,
    },

    /// The relay handshake did not complete in time
    #[error("Tunnel connect timed out after {0:?}")]
    Timeout(Duration),

    /// No local endpoint could be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation was cancelled before completing
    #[error("Tunnel connect cancelled")]
    Cancelled,
}

/// Native transport error codes, preserved for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// Failed to receive the peer's banner
    BannerRecv,
    /// Key exchange failed, usually no common algorithm
    KexFailure,
    /// Failed to send on the socket
    SocketSend,
    /// Operation timed out
    Timeout,
    /// Peer disconnected
    SocketDisconnect,
    /// Protocol violation
    Protocol,
    /// Peer rejected the credentials
    AuthenticationFailed,
    /// Requested algorithm is not supported
    MethodNotSupported,
    /// Invalid argument passed to the library
    InvalidArgument,
    /// Failed to receive from the socket
    SocketRecv,
}

impl TransportErrorCode {
    /// Numeric code as reported by the native layer
    pub fn code(self) -> i32 {
        match self {
            TransportErrorCode::BannerRecv => -2,
            TransportErrorCode::KexFailure => -5,
            TransportErrorCode::SocketSend => -7,
            TransportErrorCode::Timeout => -9,
            TransportErrorCode::SocketDisconnect => -13,
            TransportErrorCode::Protocol => -14,
            TransportErrorCode::AuthenticationFailed => -18,
            TransportErrorCode::MethodNotSupported => -33,
            TransportErrorCode::InvalidArgument => -34,
            TransportErrorCode::SocketRecv => -43,
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Secure transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The operation is not valid in the session's current state
    #[error("Cannot {operation} a session in state {state}")]
    StateMismatch {
        operation: &'static str,
        state: SessionState,
    },

    /// An argument was rejected before reaching the native layer
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Version or algorithm negotiation failed
    #[error("Negotiation failed [{code}]: {message}")]
    NegotiationFailed {
        code: TransportErrorCode,
        message: String,
    },

    /// The peer rejected the key
    #[error("Authentication failed [{code}]: {message}")]
    AuthenticationFailed {
        code: TransportErrorCode,
        message: String,
    },

    /// Any other native failure
    #[error("Transport error [{code}]: {message}")]
    Native {
        code: TransportErrorCode,
        message: String,
    },

    /// The transport library failed to initialize or was torn down
    #[error("Transport library unavailable: {0}")]
    LibraryUnavailable(String),
}

impl TransportError {
    /// Native code carried by the error, if any
    pub fn code(&self) -> Option<TransportErrorCode> {
        match self {
            TransportError::NegotiationFailed { code, .. }
            | TransportError::AuthenticationFailed { code, .. }
            | TransportError::Native { code, .. } => Some(*code),
            TransportError::InvalidArgument(_) => Some(TransportErrorCode::InvalidArgument),
            TransportError::StateMismatch { .. } | TransportError::LibraryUnavailable(_) => None,
        }
    }
}

/// Key authorization errors
#[derive(Error, Debug, Clone)]
pub enum AuthorizationError {
    /// The method mask allowed nothing
    #[error("No key authorization method allowed")]
    NoMethods,

    /// Every allowed method failed
    #[error("Authorizing key failed after trying {attempted:?}: {last_cause}")]
    Exhausted {
        attempted: Vec<AuthorizeKeyMethod>,
        last_method: AuthorizeKeyMethod,
        last_cause: String,
        /// Whether the last failure was a policy constraint rather than a fault
        constraint: bool,
    },

    /// The authorization was cancelled; nothing was recorded as published
    #[error("Key authorization cancelled")]
    Cancelled,
}

/// Terminal error of one connection attempt, surfaced to the presentation layer
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The node cannot be connected to
    #[error("{0} is not a VM instance")]
    NotConnectable(String),

    /// Opening the tunnel failed
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// Publishing the key failed
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    /// Handshake or authentication failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Both the tunnel and the key authorization failed
    #[error("Connecting failed: {tunnel}; {authorization}")]
    Both {
        tunnel: TunnelError,
        authorization: AuthorizationError,
    },

    /// Creating the key pair failed
    #[error("Key unavailable: {0}")]
    Key(String),

    /// The overall connect budget elapsed
    #[error("Connecting timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the attempt
    #[error("Connecting cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Documentation topic that helps remediate this failure, if known
    pub fn hint(&self) -> Option<HelpTopic> {
        match self {
            ConnectError::Tunnel(e) | ConnectError::Both { tunnel: e, .. } => tunnel_hint(e),
            ConnectError::Authorization(e) => authorization_hint(e),
            _ => None,
        }
    }

    /// Message suitable for showing to the operator
    pub fn user_message(&self) -> String {
        match self {
            ConnectError::Tunnel(TunnelError::RelayUnreachable { destination, .. })
            | ConnectError::Both {
                tunnel: TunnelError::RelayUnreachable { destination, .. },
                ..
            } => format!(
                "Connecting to the instance failed. Make sure that you have configured \
                 your firewall rules to permit Cloud IAP access to {}",
                destination.instance.name
            ),
            ConnectError::Tunnel(TunnelError::Unauthorized { destination, .. })
            | ConnectError::Both {
                tunnel: TunnelError::Unauthorized { destination, .. },
                ..
            } => format!(
                "You are not authorized to connect to this VM instance.\n\n\
                 Verify that the Cloud IAP API is enabled in the project {} \
                 and that your user has the 'IAP-secured Tunnel User' role.",
                destination.instance.project
            ),
            ConnectError::Transport(e) => match e.code() {
                Some(code) => format!("SSH connection failed: {} (code {})", e, code.code()),
                None => format!("SSH connection failed: {}", e),
            },
            other => other.to_string(),
        }
    }
}

fn tunnel_hint(e: &TunnelError) -> Option<HelpTopic> {
    match e {
        TunnelError::RelayUnreachable { .. } => Some(HelpTopic::CreateIapFirewallRule),
        TunnelError::Unauthorized { .. } => Some(HelpTopic::IapAccess),
        _ => None,
    }
}

fn authorization_hint(e: &AuthorizationError) -> Option<HelpTopic> {
    match e {
        AuthorizationError::Exhausted {
            last_method: AuthorizeKeyMethod::OsLogin,
            constraint: true,
            ..
        } => Some(HelpTopic::OsLoginRoles),
        _ => None,
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// The file exists but could not be read
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
