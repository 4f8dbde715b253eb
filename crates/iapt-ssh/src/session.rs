//! Secure transport session state machine
//!
//! ```text
//! Unconnected -> Negotiating -> Connected -> Authenticated -> Closed
//!                     |             |              |
//!                     +-------------+--------------+--> Failed
//! ```
//!
//! Every operation takes the per-session lock, so a session is never driven
//! from two tasks at once. `Failed` is absorbing: the session keeps reporting
//! the failure and can only be closed.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use uuid::Uuid;

use iapt_core::config::AlgorithmPreferences;
use iapt_core::error::{TransportError, TransportErrorCode};
use iapt_core::{AlgorithmCategory, SessionState};

use crate::backend::{
    HandshakeOptions, NativeSession, RusshBackend, TransportBackend, DEFAULT_STEP_TIMEOUT,
};
use crate::key::SshKey;
use crate::trace::{TraceHandler, TraceMask, TraceSlot};
use crate::transport;

/// Authenticated (or to-be-authenticated) transport over a tunnel stream
pub struct SecureTransportSession {
    id: Uuid,
    backend: Arc<dyn TransportBackend>,
    trace: TraceSlot,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SessionState,
    preferred: AlgorithmPreferences,
    banner: Option<String>,
    timeout: Duration,
    native: Option<Box<dyn NativeSession>>,
    last_error: Option<TransportErrorCode>,
}

impl Inner {
    /// A negotiation whose future was dropped leaves `Negotiating` behind
    fn settle(&mut self) {
        if self.state == SessionState::Negotiating {
            self.state = SessionState::Failed;
            self.last_error.get_or_insert(TransportErrorCode::SocketDisconnect);
        }
    }

    fn fail(&mut self, error: &TransportError) {
        self.state = SessionState::Failed;
        if let Some(code) = error.code() {
            self.last_error = Some(code);
        }
    }

    fn mismatch(&self, operation: &'static str) -> TransportError {
        TransportError::StateMismatch {
            operation,
            state: self.state,
        }
    }
}

impl SecureTransportSession {
    /// Create a session on the russh backend
    pub fn new() -> Result<Self, TransportError> {
        transport::initialize()?;
        Self::with_backend(Arc::new(RusshBackend))
    }

    /// Create a session on a specific backend
    pub fn with_backend(backend: Arc<dyn TransportBackend>) -> Result<Self, TransportError> {
        transport::ensure_available()?;
        let id = Uuid::new_v4();
        tracing::debug!("Created transport session {} ({})", id, backend.name());

        Ok(Self {
            id,
            backend,
            trace: TraceSlot::new(),
            inner: Mutex::new(Inner {
                state: SessionState::Unconnected,
                preferred: AlgorithmPreferences::default(),
                banner: None,
                timeout: DEFAULT_STEP_TIMEOUT,
                native: None,
                last_error: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        let mut inner = self.inner.lock().await;
        inner.settle();
        inner.state
    }

    /// Last native error code recorded by the session
    pub async fn last_error(&self) -> Option<TransportErrorCode> {
        self.inner.lock().await.last_error
    }

    /// Algorithms the backend supports in `category`; empty if none
    pub async fn supported_algorithms(&self, category: AlgorithmCategory) -> Vec<String> {
        let _inner = self.inner.lock().await;
        self.backend.supported_algorithms(category)
    }

    /// Restrict and order the algorithms offered for `category`
    ///
    /// Names the backend does not know are dropped. Only valid before `connect`.
    pub async fn set_preferred_algorithms(
        &self,
        category: AlgorithmCategory,
        names: &[&str],
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.settle();
        if inner.state != SessionState::Unconnected {
            return Err(inner.mismatch("set preferred algorithms on"));
        }
        if names.is_empty() {
            return Err(TransportError::InvalidArgument(format!(
                "empty {} algorithm list",
                category
            )));
        }

        let supported = self.backend.supported_algorithms(category);
        let (known, unknown): (Vec<&str>, Vec<&str>) =
            names.iter().copied().partition(|name| supported.iter().any(|s| s == name));

        if known.is_empty() {
            let error = TransportError::Native {
                code: TransportErrorCode::MethodNotSupported,
                message: format!("no supported {} algorithm in {:?}", category, names),
            };
            inner.last_error = Some(TransportErrorCode::MethodNotSupported);
            return Err(error);
        }
        if !unknown.is_empty() {
            tracing::warn!("Ignoring unsupported {} algorithms: {:?}", category, unknown);
        }

        inner
            .preferred
            .set(category, known.into_iter().map(str::to_string).collect());
        Ok(())
    }

    /// Apply every configured preference list
    pub async fn apply_preferences(
        &self,
        preferences: &AlgorithmPreferences,
    ) -> Result<(), TransportError> {
        for (category, names) in preferences.configured() {
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            self.set_preferred_algorithms(category, &names).await?;
        }
        Ok(())
    }

    /// Bound each handshake or authentication step
    pub async fn set_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        if timeout.is_zero() {
            return Err(TransportError::InvalidArgument(
                "timeout must be positive".to_string(),
            ));
        }
        self.inner.lock().await.timeout = timeout;
        Ok(())
    }

    /// Software version sent in the identification string; only valid before `connect`
    pub async fn set_banner(&self, banner: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.settle();
        if inner.state != SessionState::Unconnected {
            return Err(inner.mismatch("set the banner of"));
        }
        if banner.is_empty() || banner.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TransportError::InvalidArgument(format!(
                "invalid banner {:?}",
                banner
            )));
        }
        inner.banner = Some(banner.to_string());
        Ok(())
    }

    /// Install the diagnostic handler for the categories in `mask`
    pub fn set_trace_handler(&self, mask: TraceMask, handler: TraceHandler) {
        self.trace.set(mask, handler);
    }

    /// Run the handshake over `stream`
    ///
    /// A failed negotiation leaves the session `Failed`; it is never retried.
    pub async fn connect<S>(&self, stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        inner.settle();
        if inner.state != SessionState::Unconnected {
            return Err(inner.mismatch("connect"));
        }

        inner.state = SessionState::Negotiating;
        let options = HandshakeOptions {
            preferred: inner.preferred.clone(),
            banner: inner.banner.clone(),
        };
        let timeout = inner.timeout;

        let result = tokio::time::timeout(
            timeout,
            self.backend
                .handshake(Box::new(stream), options, self.trace.clone()),
        )
        .await;

        let native = match result {
            Ok(Ok(native)) => native,
            Ok(Err(e)) => {
                let error = as_negotiation_failure(e);
                tracing::warn!("Session {} negotiation failed: {}", self.id, error);
                inner.fail(&error);
                return Err(error);
            }
            Err(_) => {
                let error = TransportError::NegotiationFailed {
                    code: TransportErrorCode::Timeout,
                    message: format!("handshake did not complete within {:?}", timeout),
                };
                tracing::warn!("Session {} negotiation timed out", self.id);
                inner.fail(&error);
                return Err(error);
            }
        };

        inner.native = Some(native);
        inner.state = SessionState::Connected;
        tracing::debug!("Session {} connected", self.id);
        Ok(())
    }

    /// Authenticate with `key`, which the session takes ownership of
    ///
    /// Exactly one attempt is made. The key is dropped before this returns,
    /// whatever the outcome.
    pub async fn authenticate(&self, username: &str, key: SshKey) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.settle();
        if inner.state != SessionState::Connected {
            return Err(inner.mismatch("authenticate"));
        }
        if username.is_empty() {
            return Err(TransportError::InvalidArgument("empty username".to_string()));
        }

        let timeout = inner.timeout;
        let fingerprint = key.fingerprint().to_string();
        let pair = key.into_keypair();

        let Some(native) = inner.native.as_mut() else {
            return Err(TransportError::StateMismatch {
                operation: "authenticate",
                state: SessionState::Connected,
            });
        };
        let result = tokio::time::timeout(
            timeout,
            native.authenticate_publickey(username, Arc::clone(&pair)),
        )
        .await;
        drop(pair);

        let error = match result {
            Ok(Ok(true)) => {
                inner.state = SessionState::Authenticated;
                tracing::info!(
                    "Session {} authenticated as {} with key {}",
                    self.id,
                    username,
                    fingerprint
                );
                return Ok(());
            }
            Ok(Ok(false)) => TransportError::AuthenticationFailed {
                code: TransportErrorCode::AuthenticationFailed,
                message: format!("public key rejected for user {}", username),
            },
            Ok(Err(e)) => TransportError::AuthenticationFailed {
                code: e.code().unwrap_or(TransportErrorCode::Protocol),
                message: e.to_string(),
            },
            Err(_) => TransportError::AuthenticationFailed {
                code: TransportErrorCode::Timeout,
                message: format!("authentication did not complete within {:?}", timeout),
            },
        };

        tracing::warn!("Session {} authentication failed: {}", self.id, error);
        inner.fail(&error);
        Err(error)
    }

    /// Detach the trace handler and release the native session
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        self.trace.clear();

        let mut inner = self.inner.lock().await;
        inner.settle();
        if let Some(mut native) = inner.native.take() {
            if let Err(e) = native.disconnect().await {
                tracing::debug!("Session {} disconnect: {}", self.id, e);
            }
        }
        if inner.state != SessionState::Failed && inner.state != SessionState::Closed {
            inner.state = SessionState::Closed;
            tracing::debug!("Session {} closed", self.id);
        }
    }

    /// Whether the session is authenticated and its native session still alive
    pub async fn is_usable(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state == SessionState::Authenticated
            && inner.native.as_ref().map(|n| !n.is_closed()).unwrap_or(false)
    }
}

impl Drop for SecureTransportSession {
    fn drop(&mut self) {
        self.trace.clear();
        if self.inner.get_mut().native.take().is_some() {
            tracing::debug!("Session {} released on drop", self.id);
        }
    }
}

impl std::fmt::Debug for SecureTransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTransportSession")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

fn as_negotiation_failure(error: TransportError) -> TransportError {
    match error {
        TransportError::NegotiationFailed { .. } => error,
        other => TransportError::NegotiationFailed {
            code: other.code().unwrap_or(TransportErrorCode::Protocol),
            message: other.to_string(),
        },
    }
}
