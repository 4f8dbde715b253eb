//! Transport backends
//!
//! A backend performs the handshake over a byte stream and hands back a
//! native session object. The session state machine only talks to these
//! traits, so the cryptographic implementation can be swapped out.

pub mod client;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};

use iapt_core::config::AlgorithmPreferences;
use iapt_core::error::TransportError;
use iapt_core::AlgorithmCategory;

use crate::trace::TraceSlot;

pub use self::client::RusshBackend;

/// Byte stream a session runs over
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedTransportStream = Box<dyn TransportStream>;

/// Parameters fixed before the handshake starts
#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    /// Preferred algorithms; empty categories use the library default
    pub preferred: AlgorithmPreferences,
    /// Identification string suffix sent in the version exchange
    pub banner: Option<String>,
}

/// Performs handshakes for a transport library
#[async_trait]
pub trait TransportBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Algorithms the backend can negotiate in `category`
    fn supported_algorithms(&self, category: AlgorithmCategory) -> Vec<String>;

    /// Run version exchange and key exchange over `stream`
    async fn handshake(
        &self,
        stream: BoxedTransportStream,
        options: HandshakeOptions,
        trace: TraceSlot,
    ) -> Result<Box<dyn NativeSession>, TransportError>;
}

/// A connected native session
#[async_trait]
pub trait NativeSession: Send {
    /// One public key authentication attempt; `Ok(false)` means the peer rejected the key
    async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: Arc<KeyPair>,
    ) -> Result<bool, TransportError>;

    /// Send a disconnect and stop the session
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Default bound on a single handshake or authentication step
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
