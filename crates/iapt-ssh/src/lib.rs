//! iapt-ssh: SSH transport sessions over tunnel streams
//!
//! A `SecureTransportSession` wraps the local end of a tunnel and drives it
//! through algorithm negotiation, handshake and public key authentication.
//! The cryptography comes from a `TransportBackend`; `RusshBackend` is the
//! production implementation.

pub mod backend;
pub mod key;
pub mod session;
pub mod trace;
pub mod transport;

pub use backend::{
    BoxedTransportStream, HandshakeOptions, NativeSession, RusshBackend, TransportBackend,
    TransportStream,
};
pub use key::{KeyError, SshKey};
pub use session::SecureTransportSession;
pub use trace::{TraceHandler, TraceMask, TraceSlot};
pub use transport::AlgorithmCatalog;
