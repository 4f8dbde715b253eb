//! Tunnel broker
//!
//! Keeps at most one open tunnel per destination. Concurrent `connect` calls
//! for the same destination wait on one shared initialization, so the relay
//! is dialed once and every caller receives a lease on the same tunnel. The
//! tunnel is torn down when the last lease is closed.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;

use iapt_core::config::RelaySettings;
use iapt_core::error::TunnelError;
use iapt_core::Destination;

use crate::connection::{TunnelConnection, TunnelContext, TunnelInfo, TunnelLease};
use crate::dialer::{DialError, RelayDialer};
use crate::policy::RelayPolicy;
use crate::process::{PeerProcessLookup, ProcfsLookup};

/// Default window for a tunnel to admit its first connection
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type TunnelSlot = Arc<OnceCell<Arc<TunnelConnection>>>;

/// Creates, shares and tears down relay tunnels
pub struct TunnelBroker {
    dialer: Arc<dyn RelayDialer>,
    lookup: Arc<dyn PeerProcessLookup>,
    idle_timeout: Duration,
    tunnels: DashMap<Destination, TunnelSlot>,
}

impl TunnelBroker {
    /// Create a broker dialing through `dialer`
    pub fn new(dialer: Arc<dyn RelayDialer>) -> Self {
        Self {
            dialer,
            lookup: Arc::new(ProcfsLookup::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tunnels: DashMap::new(),
        }
    }

    /// Create a broker using the configured idle timeout
    pub fn from_settings(dialer: Arc<dyn RelayDialer>, settings: &RelaySettings) -> Self {
        Self::new(dialer).with_idle_timeout(settings.idle_timeout)
    }

    /// Replace the peer process lookup
    pub fn with_lookup(mut self, lookup: Arc<dyn PeerProcessLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Set how long a tunnel may wait for its first local connection
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Open a tunnel to `destination`, or join the one already open
    ///
    /// A tunnel that is reused keeps the policy it was opened with.
    pub async fn connect(
        &self,
        destination: &Destination,
        policy: Arc<dyn RelayPolicy>,
        timeout: Duration,
    ) -> Result<TunnelLease, TunnelError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let slot = Arc::clone(
                self.tunnels
                    .entry(destination.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .value(),
            );

            let mut opened_here = false;
            let init = slot.get_or_try_init(|| {
                opened_here = true;
                self.open(destination.clone(), Arc::clone(&policy))
            });

            let tunnel = match tokio::time::timeout_at(deadline, init).await {
                Err(_) => {
                    tracing::warn!("Tunnel to {} timed out after {:?}", destination, timeout);
                    return Err(TunnelError::Timeout(timeout));
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(tunnel)) => Arc::clone(tunnel),
            };

            if tunnel.state().is_terminal() {
                // Ended on its own; drop the slot and open a fresh tunnel.
                self.forget(&tunnel);
                continue;
            }

            if !opened_here {
                if !tunnel.acquire() {
                    // Its last holder is closing it.
                    self.forget(&tunnel);
                    continue;
                }
                tracing::debug!("Reusing tunnel {} for {}", tunnel.id(), destination);
            }
            return Ok(TunnelLease::new(tunnel));
        }
    }

    async fn open(
        &self,
        destination: Destination,
        policy: Arc<dyn RelayPolicy>,
    ) -> Result<Arc<TunnelConnection>, TunnelError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| TunnelError::ResourceExhausted(format!("binding local endpoint: {}", e)))?;

        let channel = self
            .dialer
            .dial(&destination)
            .await
            .map_err(|e| match e {
                DialError::Denied(reason) => TunnelError::Unauthorized {
                    destination: destination.clone(),
                    reason,
                },
                DialError::Unreachable(reason) => TunnelError::RelayUnreachable {
                    destination: destination.clone(),
                    reason,
                },
            })?;

        let context = TunnelContext {
            dialer: Arc::clone(&self.dialer),
            policy,
            lookup: Arc::clone(&self.lookup),
            idle_timeout: self.idle_timeout,
        };

        TunnelConnection::start(destination, listener, channel, context)
            .map_err(|e| TunnelError::ResourceExhausted(format!("reading local endpoint: {}", e)))
    }

    /// Give up `lease`; the tunnel closes once no other lease holds it
    ///
    /// Closing the same lease twice is a no-op.
    pub fn close(&self, lease: &TunnelLease) {
        if lease.release() {
            lease.close();
            self.forget(lease);
        } else if lease.is_open() {
            tracing::debug!(
                "Tunnel {} to {} still shared, keeping it open",
                lease.id(),
                lease.destination()
            );
        }
    }

    /// Close every tunnel, whoever holds it
    pub fn close_all(&self) {
        let tunnels: Vec<_> = self
            .tunnels
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        for tunnel in tunnels {
            tunnel.close();
            self.forget(&tunnel);
        }
    }

    /// Open tunnel for a destination, if any
    pub fn get(&self, destination: &Destination) -> Option<Arc<TunnelConnection>> {
        self.tunnels
            .get(destination)
            .and_then(|slot| slot.value().get().cloned())
            .filter(|tunnel| tunnel.is_open())
    }

    /// Snapshots of all open tunnels
    pub fn list(&self) -> Vec<TunnelInfo> {
        self.tunnels
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .filter(|tunnel| tunnel.is_open())
            .map(|tunnel| tunnel.info())
            .collect()
    }

    /// Remove the slot holding `tunnel`, leaving any newer tunnel in place
    fn forget(&self, tunnel: &TunnelConnection) {
        let id = tunnel.id();
        self.tunnels.remove_if(tunnel.destination(), |_, slot| {
            slot.get().map(|t| t.id() == id).unwrap_or(false)
        });
    }
}

impl Drop for TunnelBroker {
    fn drop(&mut self) {
        for entry in self.tunnels.iter() {
            if let Some(tunnel) = entry.value().get() {
                tunnel.close();
            }
        }
    }
}
