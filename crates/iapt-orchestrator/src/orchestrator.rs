//! Connection orchestration
//!
//! `ConnectionOrchestrator::connect` turns a resource node into an
//! authenticated SSH transport session:
//!
//! 1. An authenticated session already registered for the destination is
//!    returned as is.
//! 2. The tunnel is opened and the key published concurrently, under one
//!    deadline. Either failing cancels the other.
//! 3. Once both are ready a session is built over the tunnel's local
//!    endpoint, which then connects and authenticates.
//! 4. The session is registered and returned.
//!
//! Partial resources are released before an error is returned: an opened
//! tunnel is closed, a published key is revoked and the private key is
//! dropped. Disconnecting a session releases its tunnel and key the same way.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use iapt_core::config::ConnectionSettings;
use iapt_core::error::{
    AuthorizationError, ConnectError, TransportError, TransportErrorCode, TunnelError,
};
use iapt_core::{Destination, ResourceNode};
use iapt_ssh::{SecureTransportSession, SshKey, TraceHandler, TraceMask, TransportBackend};
use iapt_tunnel::{RelayPolicy, SameProcessPolicy, TunnelBroker, TunnelConnection, TunnelLease};

use crate::authorizer::{AuthorizedKey, KeyAuthorizer};
use crate::keys::{EphemeralKeyProvider, KeyProvider};
use crate::registry::{SessionEntry, SessionInfo, SessionRegistry};

/// Drives tunnel, key publication and SSH handshake for a connection
pub struct ConnectionOrchestrator {
    broker: Arc<TunnelBroker>,
    authorizer: Arc<KeyAuthorizer>,
    settings: ConnectionSettings,
    keys: Arc<dyn KeyProvider>,
    backend: Option<Arc<dyn TransportBackend>>,
    policy: Arc<dyn RelayPolicy>,
    trace: Option<(TraceMask, TraceHandler)>,
    registry: SessionRegistry,
    /// Serializes connects to the same destination
    gates: DashMap<Destination, Arc<Mutex<()>>>,
}

impl ConnectionOrchestrator {
    pub fn new(
        broker: Arc<TunnelBroker>,
        authorizer: Arc<KeyAuthorizer>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            broker,
            authorizer,
            settings,
            keys: Arc::new(EphemeralKeyProvider),
            backend: None,
            policy: Arc::new(SameProcessPolicy::new()),
            trace: None,
            registry: SessionRegistry::default(),
            gates: DashMap::new(),
        }
    }

    /// Use `keys` instead of generating an ephemeral key per attempt
    pub fn with_key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    /// Build sessions on `backend` instead of the default russh backend
    pub fn with_backend(mut self, backend: Arc<dyn TransportBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Policy for tunnels opened by this orchestrator
    pub fn with_policy(mut self, policy: Arc<dyn RelayPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Install `handler` on every session this orchestrator builds
    pub fn with_trace_handler(mut self, mask: TraceMask, handler: TraceHandler) -> Self {
        self.trace = Some((mask, handler));
        self
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn broker(&self) -> &Arc<TunnelBroker> {
        &self.broker
    }

    pub fn authorizer(&self) -> &Arc<KeyAuthorizer> {
        &self.authorizer
    }

    /// Connect to `node` and return an authenticated session
    pub async fn connect(
        &self,
        node: &ResourceNode,
        cancel: &CancellationToken,
    ) -> Result<Arc<SecureTransportSession>, ConnectError> {
        let destination = node
            .connection_target(self.settings.ssh_port)
            .ok_or_else(|| ConnectError::NotConnectable(node.display_name().to_string()))?;

        let gate = self.gate(&destination);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            guard = gate.lock_owned() => guard,
        };

        if let Some(session) = self.registry.session(&destination) {
            if session.is_usable().await {
                tracing::debug!("Reusing session {} for {}", session.id(), destination);
                return Ok(session);
            }
            tracing::debug!("Dropping stale session {} for {}", session.id(), destination);
            self.release(&destination).await;
        }

        let key = self
            .keys
            .create_key()
            .map_err(|e| ConnectError::Key(e.to_string()))?;

        let (tunnel, authorized) = match self.prepare(&destination, &key, cancel).await {
            Ok(prepared) => prepared,
            Err(e) => {
                drop(key);
                tracing::warn!("Connecting to {} failed: {}", destination, e);
                return Err(e);
            }
        };

        let session = match self
            .establish(&destination, &tunnel, &authorized, key, cancel)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.broker.close(&tunnel);
                self.authorizer.revoke(&destination.instance, &authorized).await;
                tracing::warn!("Connecting to {} failed: {}", destination, e);
                return Err(e);
            }
        };

        tracing::info!(
            "Connected to {} as {} through tunnel {} (port {})",
            destination,
            authorized.username,
            tunnel.id(),
            tunnel.local_port()
        );
        let entry = SessionEntry::new(Arc::clone(&session), tunnel, authorized);
        if let Some(previous) = self.registry.insert(destination.clone(), entry) {
            self.teardown(&destination, previous).await;
        }
        Ok(session)
    }

    /// Snapshots of the registered sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Close the session for `destination` and its tunnel
    ///
    /// Returns false if no session was registered.
    pub async fn disconnect(&self, destination: &Destination) -> bool {
        let released = self.release(destination).await;
        if released {
            tracing::info!("Disconnected from {}", destination);
        }
        released
    }

    /// Close every registered session and its tunnel
    pub async fn close_all(&self) {
        for (destination, entry) in self.registry.drain() {
            self.teardown(&destination, entry).await;
        }
    }

    fn gate(&self, destination: &Destination) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.entry(destination.clone()).or_default().value())
    }

    async fn release(&self, destination: &Destination) -> bool {
        match self.registry.remove(destination) {
            Some(entry) => {
                self.teardown(destination, entry).await;
                true
            }
            None => false,
        }
    }

    /// Close the session, give up its tunnel lease and withdraw its key
    async fn teardown(&self, destination: &Destination, entry: SessionEntry) {
        entry.session.close().await;
        self.broker.close(&entry.tunnel);
        self.authorizer
            .revoke(&destination.instance, &entry.authorized)
            .await;
    }

    /// Open the tunnel and publish the key concurrently
    async fn prepare(
        &self,
        destination: &Destination,
        key: &SshKey,
        cancel: &CancellationToken,
    ) -> Result<(TunnelLease, AuthorizedKey), ConnectError> {
        let budget = self.settings.connection_timeout;
        let deadline = tokio::time::Instant::now() + budget;
        let attempt = cancel.child_token();
        let timed_out = AtomicBool::new(false);

        let tunnel_step = async {
            let result = tokio::select! {
                biased;
                result = self.broker.connect(destination, Arc::clone(&self.policy), budget) => result,
                _ = attempt.cancelled() => Err(TunnelError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out.store(true, Ordering::SeqCst);
                    Err(TunnelError::Timeout(budget))
                }
            };
            if result.is_err() {
                attempt.cancel();
            }
            result
        };

        let auth_step = async {
            let result = tokio::select! {
                biased;
                result = self.authorizer.authorize_key(
                    destination,
                    key,
                    self.settings.key_validity,
                    self.settings.ssh_username.as_deref(),
                    self.settings.authorize_methods,
                    &attempt,
                ) => result,
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out.store(true, Ordering::SeqCst);
                    Err(AuthorizationError::Cancelled)
                }
            };
            if result.is_err() {
                attempt.cancel();
            }
            result
        };

        let (tunnel, authorized) = tokio::join!(tunnel_step, auth_step);

        let (tunnel_err, auth_err) = match (tunnel, authorized) {
            (Ok(tunnel), Ok(authorized)) => return Ok((tunnel, authorized)),
            (Ok(tunnel), Err(e)) => {
                tracing::debug!("Closing tunnel {} after failed key authorization", tunnel.id());
                self.broker.close(&tunnel);
                (None, Some(e))
            }
            (Err(e), Ok(authorized)) => {
                tracing::debug!("Revoking key for {} after failed tunnel", destination);
                self.authorizer
                    .revoke(&destination.instance, &authorized)
                    .await;
                (Some(e), None)
            }
            (Err(t), Err(a)) => (Some(t), Some(a)),
        };

        let timed_out = timed_out.load(Ordering::SeqCst)
            || matches!(tunnel_err, Some(TunnelError::Timeout(_)));

        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let tunnel_err =
            tunnel_err.filter(|e| !matches!(e, TunnelError::Cancelled | TunnelError::Timeout(_)));
        let auth_err = auth_err.filter(|e| !matches!(e, AuthorizationError::Cancelled));

        Err(match (tunnel_err, auth_err) {
            (Some(tunnel), Some(authorization)) => ConnectError::Both {
                tunnel,
                authorization,
            },
            (Some(tunnel), None) => ConnectError::Tunnel(tunnel),
            (None, Some(authorization)) => ConnectError::Authorization(authorization),
            (None, None) if timed_out => ConnectError::Timeout(budget),
            (None, None) => ConnectError::Cancelled,
        })
    }

    /// Build a session over the tunnel and authenticate with `key`
    async fn establish(
        &self,
        destination: &Destination,
        tunnel: &TunnelConnection,
        authorized: &AuthorizedKey,
        key: SshKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<SecureTransportSession>, ConnectError> {
        let session = match &self.backend {
            Some(backend) => SecureTransportSession::with_backend(Arc::clone(backend))?,
            None => SecureTransportSession::new()?,
        };
        if let Some((mask, handler)) = &self.trace {
            session.set_trace_handler(*mask, Arc::clone(handler));
        }
        session.set_timeout(self.settings.connection_timeout).await?;
        session.apply_preferences(&self.settings.algorithms).await?;
        let session = Arc::new(session);

        let handshake = async {
            let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, tunnel.local_port()))
                .await
                .map_err(|e| TransportError::Native {
                    code: TransportErrorCode::SocketDisconnect,
                    message: format!("tunnel endpoint for {}: {}", destination, e),
                })?;
            session.connect(stream).await?;
            session.authenticate(&authorized.username, key).await?;
            Ok::<(), TransportError>(())
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = handshake => result.map_err(ConnectError::from),
        };

        match result {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }
}
