//! iapt-orchestrator: from a resource node to an authenticated SSH session
//!
//! Combines the tunnel broker, key authorization and the SSH transport
//! session into one `connect` call, and keeps a registry of the sessions it
//! established.

pub mod authorizer;
pub mod keys;
pub mod orchestrator;
pub mod publisher;
pub mod registry;

pub use authorizer::{generate_username, AuthorizedKey, KeyAuthorizer};
pub use keys::{EphemeralKeyProvider, FileKeyProvider, KeyProvider};
pub use orchestrator::ConnectionOrchestrator;
pub use publisher::{AuthorizedKeysFilePublisher, KeyPublisher, PublishOutcome, PublishRequest};
pub use registry::SessionInfo;
