//! Session state machine tests against a scripted backend

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh_keys::key::KeyPair;

use iapt_core::error::{TransportError, TransportErrorCode};
use iapt_core::{AlgorithmCategory, SessionState};
use iapt_ssh::{
    BoxedTransportStream, HandshakeOptions, NativeSession, SecureTransportSession, SshKey,
    TraceHandler, TraceMask, TraceSlot, TransportBackend,
};

#[derive(Clone, Copy)]
enum Handshake {
    Succeed,
    FailKex,
    Hang,
}

#[derive(Default)]
struct Counters {
    handshakes: AtomicUsize,
    auth_attempts: AtomicUsize,
    disconnects: AtomicUsize,
    released: AtomicUsize,
}

struct ScriptedBackend {
    handshake: Handshake,
    accept_key: bool,
    counters: Arc<Counters>,
    options: Mutex<Option<HandshakeOptions>>,
}

impl ScriptedBackend {
    fn new(handshake: Handshake, accept_key: bool) -> Arc<Self> {
        Arc::new(Self {
            handshake,
            accept_key,
            counters: Arc::new(Counters::default()),
            options: Mutex::new(None),
        })
    }

    fn seen_options(&self) -> HandshakeOptions {
        self.options.lock().unwrap().clone().expect("no handshake ran")
    }
}

#[async_trait]
impl TransportBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supported_algorithms(&self, category: AlgorithmCategory) -> Vec<String> {
        match category {
            AlgorithmCategory::Kex => vec!["curve25519-sha256".into(), "diffie-hellman-group14-sha256".into()],
            AlgorithmCategory::HostKey => vec!["ssh-ed25519".into()],
            AlgorithmCategory::Cipher => vec![
                "chacha20-poly1305@openssh.com".into(),
                "aes256-gcm@openssh.com".into(),
                "aes128-ctr".into(),
            ],
            AlgorithmCategory::Mac => vec!["hmac-sha2-256".into()],
            AlgorithmCategory::Compression => vec!["none".into()],
        }
    }

    async fn handshake(
        &self,
        _stream: BoxedTransportStream,
        options: HandshakeOptions,
        trace: TraceSlot,
    ) -> Result<Box<dyn NativeSession>, TransportError> {
        self.counters.handshakes.fetch_add(1, Ordering::SeqCst);
        *self.options.lock().unwrap() = Some(options);
        trace.emit(TraceMask::KEX, "kex");

        match self.handshake {
            Handshake::Succeed => Ok(Box::new(ScriptedNative {
                accept_key: self.accept_key,
                counters: Arc::clone(&self.counters),
                trace,
            })),
            Handshake::FailKex => Err(TransportError::NegotiationFailed {
                code: TransportErrorCode::KexFailure,
                message: "no common kex algorithm".into(),
            }),
            Handshake::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

struct ScriptedNative {
    accept_key: bool,
    counters: Arc<Counters>,
    trace: TraceSlot,
}

#[async_trait]
impl NativeSession for ScriptedNative {
    async fn authenticate_publickey(
        &mut self,
        _username: &str,
        _key: Arc<KeyPair>,
    ) -> Result<bool, TransportError> {
        self.counters.auth_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept_key)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        self.trace.emit(TraceMask::CONNECTION, "disconnect");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

impl Drop for ScriptedNative {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn stream() -> tokio::io::DuplexStream {
    let (near, far) = tokio::io::duplex(1024);
    // Keep the far end alive for the duration of the test.
    std::mem::forget(far);
    near
}

fn recorder() -> (TraceHandler, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: TraceHandler = Arc::new(move |_: TraceMask, message: &str| {
        sink.lock().unwrap().push(message.to_string());
    });
    (handler, seen)
}

#[tokio::test]
async fn test_second_connect_is_state_mismatch() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();

    session.connect(stream()).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);

    let err = session.connect(stream()).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::StateMismatch {
            operation: "connect",
            state: SessionState::Connected
        }
    ));
    assert_eq!(session.state().await, SessionState::Connected);
    assert_eq!(backend.counters.handshakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_preferences_only_before_connect() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();

    session
        .set_preferred_algorithms(
            AlgorithmCategory::Cipher,
            &["aes128-ctr", "rot13@example.com", "aes256-gcm@openssh.com"],
        )
        .await
        .unwrap();
    session.set_banner("iapt_0.1").await.unwrap();
    session.connect(stream()).await.unwrap();

    let options = backend.seen_options();
    assert_eq!(
        options.preferred.cipher,
        vec!["aes128-ctr", "aes256-gcm@openssh.com"]
    );
    assert_eq!(options.banner.as_deref(), Some("iapt_0.1"));

    let err = session
        .set_preferred_algorithms(AlgorithmCategory::Mac, &["hmac-sha2-256"])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::StateMismatch { .. }));
}

#[tokio::test]
async fn test_invalid_preferences() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend).unwrap();

    let err = session
        .set_preferred_algorithms(AlgorithmCategory::Kex, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidArgument(_)));

    let err = session
        .set_preferred_algorithms(AlgorithmCategory::Kex, &["made-up-kex"])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(TransportErrorCode::MethodNotSupported));
    assert_eq!(
        session.last_error().await,
        Some(TransportErrorCode::MethodNotSupported)
    );
    assert_eq!(session.state().await, SessionState::Unconnected);
}

#[tokio::test]
async fn test_negotiation_failure_is_final() {
    let backend = ScriptedBackend::new(Handshake::FailKex, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();

    let err = session.connect(stream()).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::NegotiationFailed {
            code: TransportErrorCode::KexFailure,
            ..
        }
    ));
    assert_eq!(session.state().await, SessionState::Failed);
    assert_eq!(session.last_error().await, Some(TransportErrorCode::KexFailure));

    let err = session.connect(stream()).await.unwrap_err();
    assert!(matches!(err, TransportError::StateMismatch { .. }));
    assert_eq!(backend.counters.handshakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let backend = ScriptedBackend::new(Handshake::Hang, true);
    let session = SecureTransportSession::with_backend(backend).unwrap();
    session.set_timeout(Duration::from_millis(50)).await.unwrap();

    let err = session.connect(stream()).await.unwrap_err();
    assert_eq!(err.code(), Some(TransportErrorCode::Timeout));
    assert_eq!(session.state().await, SessionState::Failed);
}

#[tokio::test]
async fn test_authenticate_success() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();

    session.connect(stream()).await.unwrap();
    session
        .authenticate("alice", SshKey::generate_ed25519().unwrap())
        .await
        .unwrap();

    assert_eq!(session.state().await, SessionState::Authenticated);
    assert!(session.is_usable().await);
    assert_eq!(backend.counters.auth_attempts.load(Ordering::SeqCst), 1);

    let err = session
        .connect(stream())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::StateMismatch {
            state: SessionState::Authenticated,
            ..
        }
    ));
}

#[tokio::test]
async fn test_rejected_key_makes_one_attempt() {
    let backend = ScriptedBackend::new(Handshake::Succeed, false);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();

    session.connect(stream()).await.unwrap();
    let err = session
        .authenticate("alice", SshKey::generate_ed25519().unwrap())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransportError::AuthenticationFailed {
            code: TransportErrorCode::AuthenticationFailed,
            ..
        }
    ));
    assert_eq!(session.state().await, SessionState::Failed);
    assert_eq!(backend.counters.auth_attempts.load(Ordering::SeqCst), 1);

    let err = session
        .authenticate("alice", SshKey::generate_ed25519().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::StateMismatch { .. }));
    assert_eq!(backend.counters.auth_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_authenticate_before_connect() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();

    let err = session
        .authenticate("alice", SshKey::generate_ed25519().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::StateMismatch {
            operation: "authenticate",
            state: SessionState::Unconnected
        }
    ));
    assert_eq!(backend.counters.auth_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_detaches_trace_then_releases_once() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();
    let (handler, seen) = recorder();
    session.set_trace_handler(TraceMask::ALL, handler);

    session.connect(stream()).await.unwrap();
    session.close().await;
    session.close().await;

    assert_eq!(session.state().await, SessionState::Closed);
    assert_eq!(backend.counters.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(backend.counters.released.load(Ordering::SeqCst), 1);

    // The handler saw the handshake but not the disconnect.
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["kex"]);

    // Read-only queries still work after close.
    assert!(!session
        .supported_algorithms(AlgorithmCategory::Cipher)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_drop_releases_native_session() {
    let backend = ScriptedBackend::new(Handshake::Succeed, true);
    let session = SecureTransportSession::with_backend(backend.clone()).unwrap();
    session.connect(stream()).await.unwrap();

    drop(session);
    assert_eq!(backend.counters.released.load(Ordering::SeqCst), 1);
    assert_eq!(backend.counters.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_connect_leaves_session_failed() {
    let backend = ScriptedBackend::new(Handshake::Hang, true);
    let session = SecureTransportSession::with_backend(backend).unwrap();

    let attempt = tokio::time::timeout(Duration::from_millis(50), session.connect(stream())).await;
    assert!(attempt.is_err());

    assert_eq!(session.state().await, SessionState::Failed);
    let err = session.connect(stream()).await.unwrap_err();
    assert!(matches!(err, TransportError::StateMismatch { .. }));
}

#[tokio::test]
async fn test_russh_backend_fails_on_closed_stream() {
    let session = SecureTransportSession::new().unwrap();
    session.set_timeout(Duration::from_secs(5)).await.unwrap();

    let (near, far) = tokio::io::duplex(1024);
    drop(far);

    let err = session.connect(near).await.unwrap_err();
    assert!(matches!(err, TransportError::NegotiationFailed { .. }));
    assert_eq!(session.state().await, SessionState::Failed);
    assert!(session.last_error().await.is_some());
}

#[tokio::test]
async fn test_russh_backend_lists_catalog() {
    let session = SecureTransportSession::new().unwrap();
    let kex = session.supported_algorithms(AlgorithmCategory::Kex).await;
    assert!(!kex.is_empty());

    let names: Vec<&str> = kex.iter().map(String::as_str).take(1).collect();
    session
        .set_preferred_algorithms(AlgorithmCategory::Kex, &names)
        .await
        .unwrap();
}
