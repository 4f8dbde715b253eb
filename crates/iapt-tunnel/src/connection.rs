//! A single relay tunnel
//!
//! A tunnel owns an ephemeral loopback listener and the remote channel that
//! was dialed while the tunnel was opened. The accept loop evaluates the relay
//! policy for every inbound connection and spawns a pump task per admitted
//! connection. The tunnel closes once its last relayed connection ends, when
//! it stays idle past its window, or when it is closed explicitly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use iapt_core::error::TunnelError;
use iapt_core::time::current_time_secs;
use iapt_core::{Destination, TunnelState};

use crate::dialer::{BoxedRelayStream, RelayDialer};
use crate::policy::{IncomingConnection, RelayPolicy};
use crate::process::PeerProcessLookup;

/// Capacity of the per-tunnel event channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Notification published by a tunnel
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A local connection was admitted and is being relayed
    ConnectionAccepted { peer: SocketAddr },
    /// A local connection was refused by the relay policy
    ConnectionRejected { error: TunnelError },
    /// The tunnel closed cleanly
    Closed,
    /// The tunnel terminated because of an I/O error
    Failed { reason: String },
}

/// Snapshot of a tunnel for listing
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub destination: Destination,
    pub local_port: u16,
    pub state: TunnelState,
    pub policy: &'static str,
    pub active_connections: usize,
    pub served_connections: usize,
    /// Number of broker callers sharing this tunnel
    pub users: usize,
    pub created_at: u64,
}

/// Collaborators a tunnel needs while it runs
pub(crate) struct TunnelContext {
    pub dialer: Arc<dyn RelayDialer>,
    pub policy: Arc<dyn RelayPolicy>,
    pub lookup: Arc<dyn PeerProcessLookup>,
    pub idle_timeout: Duration,
}

/// An open relay tunnel, exposed as a local endpoint
pub struct TunnelConnection {
    id: Uuid,
    destination: Destination,
    local_addr: SocketAddr,
    policy_name: &'static str,
    state: AtomicU8,
    active: AtomicUsize,
    served: AtomicUsize,
    users: AtomicUsize,
    created_at: u64,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
}

fn state_to_u8(state: TunnelState) -> u8 {
    match state {
        TunnelState::Connecting => 0,
        TunnelState::Open => 1,
        TunnelState::Closed => 2,
        TunnelState::Failed => 3,
    }
}

fn state_from_u8(value: u8) -> TunnelState {
    match value {
        0 => TunnelState::Connecting,
        1 => TunnelState::Open,
        2 => TunnelState::Closed,
        _ => TunnelState::Failed,
    }
}

impl TunnelConnection {
    /// Start relaying on `listener`, with `channel` serving the first admitted connection
    pub(crate) fn start(
        destination: Destination,
        listener: TcpListener,
        channel: BoxedRelayStream,
        context: TunnelContext,
    ) -> std::io::Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let tunnel = Arc::new(Self {
            id: Uuid::new_v4(),
            destination,
            local_addr,
            policy_name: context.policy.name(),
            state: AtomicU8::new(state_to_u8(TunnelState::Connecting)),
            active: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
            users: AtomicUsize::new(1),
            created_at: current_time_secs(),
            cancel: CancellationToken::new(),
            events,
        });

        tunnel
            .state
            .store(state_to_u8(TunnelState::Open), Ordering::SeqCst);
        tracing::info!(
            "Tunnel {} open for {} on {} (policy: {})",
            tunnel.id,
            tunnel.destination,
            local_addr,
            tunnel.policy_name
        );

        let runner = Arc::clone(&tunnel);
        tokio::spawn(async move {
            runner.run(listener, Some(channel), context).await;
        });

        Ok(tunnel)
    }

    /// Unique tunnel ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Loopback address of the tunnel endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port of the tunnel endpoint; only valid while the tunnel is open
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> TunnelState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == TunnelState::Open
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy_name
    }

    /// Connections currently being relayed
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Connections admitted over the tunnel's lifetime
    pub fn served_connections(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Wait until the tunnel has stopped
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Snapshot for listing
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id,
            destination: self.destination.clone(),
            local_port: self.local_port(),
            state: self.state(),
            policy: self.policy_name,
            active_connections: self.active_connections(),
            served_connections: self.served_connections(),
            users: self.users.load(Ordering::SeqCst),
            created_at: self.created_at,
        }
    }

    /// Stop the pumps, close the listener and release the remote channel
    ///
    /// Closing an already terminated tunnel does nothing.
    pub fn close(&self) {
        self.finish(TunnelState::Closed, None);
    }

    /// Record another caller sharing this tunnel
    ///
    /// Fails once the last share was released, so a tunnel that is about to
    /// stop is never handed out again.
    pub(crate) fn acquire(&self) -> bool {
        self.users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |users| {
                (users > 0).then_some(users + 1)
            })
            .is_ok()
    }

    /// Drop one caller's share; true if it was the last one
    fn release(&self) -> bool {
        matches!(
            self.users.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |users| {
                users.checked_sub(1)
            }),
            Ok(1)
        )
    }

    /// Move to a terminal state; returns false if the tunnel already ended
    fn finish(&self, state: TunnelState, reason: Option<String>) -> bool {
        let target = state_to_u8(state);
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if state_from_u8(current).is_terminal() {
                return false;
            }
            match self
                .state
                .compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.cancel.cancel();

        let event = match (state, reason) {
            (TunnelState::Failed, reason) => {
                let reason = reason.unwrap_or_else(|| "unknown error".to_string());
                tracing::warn!("Tunnel {} to {} failed: {}", self.id, self.destination, reason);
                TunnelEvent::Failed { reason }
            }
            _ => {
                tracing::info!("Tunnel {} to {} closed", self.id, self.destination);
                TunnelEvent::Closed
            }
        };
        let _ = self.events.send(event);
        true
    }

    async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut channel: Option<BoxedRelayStream>,
        context: TunnelContext,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<Result<(), String>>(EVENT_CHANNEL_CAPACITY);
        let idle = tokio::time::sleep(context.idle_timeout);
        tokio::pin!(idle);
        let mut failure: Option<String> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                _ = &mut idle, if self.served_connections() == 0 => {
                    tracing::info!(
                        "Tunnel {} idle for {:?} without a connection, closing",
                        self.id,
                        context.idle_timeout
                    );
                    self.finish(TunnelState::Closed, None);
                    break;
                }

                Some(result) = done_rx.recv() => {
                    if let Err(reason) = result {
                        failure = Some(reason);
                    }
                    let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                    if remaining == 0 {
                        match failure.take() {
                            Some(reason) => self.finish(TunnelState::Failed, Some(reason)),
                            None => self.finish(TunnelState::Closed, None),
                        };
                        break;
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        self.admit(socket, peer, &mut channel, &context, &done_tx).await;
                    }
                    Err(e) => {
                        tracing::warn!("Tunnel {} failed to accept: {}", self.id, e);
                    }
                },
            }
        }

        tracing::debug!("Tunnel {} accept loop stopped", self.id);
    }

    async fn admit(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        channel: &mut Option<BoxedRelayStream>,
        context: &TunnelContext,
        done: &mpsc::Sender<Result<(), String>>,
    ) {
        let lookup = Arc::clone(&context.lookup);
        let local = self.local_addr;
        let owner_pid = tokio::task::spawn_blocking(move || lookup.owner_of(peer, local))
            .await
            .ok()
            .flatten();

        let incoming = IncomingConnection {
            peer,
            local,
            owner_pid,
            active_connections: self.active_connections(),
        };
        let decision = context.policy.evaluate(&incoming);

        if !decision.allow {
            tracing::warn!(
                "Tunnel {} rejected connection from {} (owner {:?}): {}",
                self.id,
                peer,
                owner_pid,
                decision.reason
            );
            reset(socket);
            let _ = self.events.send(TunnelEvent::ConnectionRejected {
                error: TunnelError::PolicyRejected {
                    peer,
                    policy: context.policy.name(),
                    reason: decision.reason,
                },
            });
            return;
        }

        tracing::debug!(
            "Tunnel {} admitted connection from {}: {}",
            self.id,
            peer,
            decision.reason
        );
        self.active.fetch_add(1, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(TunnelEvent::ConnectionAccepted { peer });

        let channel = channel.take();
        let dialer = Arc::clone(&context.dialer);
        let destination = self.destination.clone();
        let cancel = self.cancel.child_token();
        let done = done.clone();
        let id = self.id;

        tokio::spawn(async move {
            let result = async {
                let remote = match channel {
                    Some(remote) => remote,
                    None => dialer
                        .dial(&destination)
                        .await
                        .map_err(|e| e.to_string())?,
                };
                pump(socket, remote, cancel)
                    .await
                    .map_err(|e| format!("relaying {}: {}", peer, e))
            }
            .await;

            if let Err(ref reason) = result {
                tracing::debug!("Tunnel {} pump for {} ended with error: {}", id, peer, reason);
            }
            let _ = done.send(result).await;
        });
    }
}

/// One caller's share of a tunnel
///
/// `TunnelBroker::connect` hands out one lease per caller. Passing it back to
/// `TunnelBroker::close` gives up that share; the tunnel stops once every
/// share has been given up. Releasing the same lease twice does nothing.
pub struct TunnelLease {
    tunnel: Arc<TunnelConnection>,
    released: AtomicBool,
}

impl TunnelLease {
    pub(crate) fn new(tunnel: Arc<TunnelConnection>) -> Self {
        Self {
            tunnel,
            released: AtomicBool::new(false),
        }
    }

    /// The shared tunnel
    pub fn tunnel(&self) -> &Arc<TunnelConnection> {
        &self.tunnel
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give up this share; true if no other caller holds the tunnel
    pub(crate) fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tunnel.release()
    }
}

impl std::ops::Deref for TunnelLease {
    type Target = TunnelConnection;

    fn deref(&self) -> &TunnelConnection {
        &self.tunnel
    }
}

impl std::fmt::Debug for TunnelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelLease")
            .field("tunnel", &self.tunnel)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Drop a socket with an RST instead of a FIN
fn reset(socket: TcpStream) {
    if let Err(e) = socket2::SockRef::from(&socket).set_linger(Some(Duration::ZERO)) {
        tracing::debug!("Failed to set linger on rejected socket: {}", e);
    }
    drop(socket);
}

/// Copy bytes both ways until both sides reach EOF or the tunnel stops
///
/// EOF on one side is forwarded as a write shutdown to the other side.
async fn pump(
    mut local: TcpStream,
    mut remote: BoxedRelayStream,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
            let (to_remote, to_local) = result?;
            tracing::debug!("Pump finished: {} bytes out, {} bytes in", to_remote, to_local);
            Ok(())
        }
    }
}
