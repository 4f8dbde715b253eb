//! Registry of authenticated sessions, one per destination

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use iapt_core::time::current_time_secs;
use iapt_core::{AuthorizeKeyMethod, Destination};
use iapt_ssh::SecureTransportSession;
use iapt_tunnel::TunnelLease;

use crate::authorizer::AuthorizedKey;

/// Snapshot of a registered session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub tunnel_id: Uuid,
    pub destination: Destination,
    pub local_port: u16,
    pub username: String,
    pub method: AuthorizeKeyMethod,
    pub connected_at: u64,
}

/// A session together with the tunnel lease and key publication it uses
pub(crate) struct SessionEntry {
    pub session: Arc<SecureTransportSession>,
    pub tunnel: TunnelLease,
    pub authorized: AuthorizedKey,
    pub connected_at: u64,
}

impl SessionEntry {
    pub fn new(
        session: Arc<SecureTransportSession>,
        tunnel: TunnelLease,
        authorized: AuthorizedKey,
    ) -> Self {
        Self {
            session,
            tunnel,
            authorized,
            connected_at: current_time_secs(),
        }
    }

    fn info(&self, destination: &Destination) -> SessionInfo {
        SessionInfo {
            session_id: self.session.id(),
            tunnel_id: self.tunnel.id(),
            destination: destination.clone(),
            local_port: self.tunnel.local_port(),
            username: self.authorized.username.clone(),
            method: self.authorized.method,
            connected_at: self.connected_at,
        }
    }
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    entries: DashMap<Destination, SessionEntry>,
}

impl SessionRegistry {
    pub fn session(&self, destination: &Destination) -> Option<Arc<SecureTransportSession>> {
        self.entries
            .get(destination)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub fn insert(&self, destination: Destination, entry: SessionEntry) -> Option<SessionEntry> {
        self.entries.insert(destination, entry)
    }

    pub fn remove(&self, destination: &Destination) -> Option<SessionEntry> {
        self.entries.remove(destination).map(|(_, entry)| entry)
    }

    pub fn drain(&self) -> Vec<(Destination, SessionEntry)> {
        let destinations: Vec<Destination> =
            self.entries.iter().map(|entry| entry.key().clone()).collect();
        destinations
            .into_iter()
            .filter_map(|destination| self.entries.remove(&destination))
            .collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.entries
            .iter()
            .map(|entry| entry.value().info(entry.key()))
            .collect()
    }
}
