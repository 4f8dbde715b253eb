//! iapt-tunnel: Relay tunnels exposed as local endpoints
//!
//! The broker dials an intermediary relay for a destination, binds an
//! ephemeral loopback listener and pumps bytes between the first admitted
//! local connection and the relay channel. A relay policy decides which
//! local connections are admitted.

pub mod broker;
pub mod connection;
pub mod dialer;
pub mod policy;
pub mod process;

pub use broker::TunnelBroker;
pub use connection::{TunnelConnection, TunnelEvent, TunnelInfo, TunnelLease};
pub use dialer::{BoxedRelayStream, DialError, RelayDialer, RelayStream, TcpRelayDialer};
pub use policy::{AllowAllPolicy, IncomingConnection, RelayDecision, RelayPolicy, SameProcessPolicy};
pub use process::{PeerProcessLookup, ProcfsLookup};
