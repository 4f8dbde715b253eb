//! Key authorization
//!
//! Publishes a public key for a destination through the first method in the
//! allowed mask that accepts it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use iapt_core::error::AuthorizationError;
use iapt_core::time::{expires_within, expiry_from_now};
use iapt_core::{AuthorizeKeyMethod, AuthorizeKeyMethods, Destination, InstanceLocator};
use iapt_ssh::SshKey;

use crate::publisher::{KeyPublisher, PublishOutcome, PublishRequest};

/// Cached keys closer than this to expiry are published again
const REUSE_MARGIN: Duration = Duration::from_secs(60);

/// Longest username accepted by the guest environment
const MAX_USERNAME_LEN: usize = 32;

/// A key that has been published for an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizedKey {
    pub public_key: String,
    /// SHA-256 of the public key blob, hex encoded
    pub key_id: String,
    pub username: String,
    pub expires_at: u64,
    pub method: AuthorizeKeyMethod,
}

/// Publishes keys through the configured methods and remembers what it published
pub struct KeyAuthorizer {
    account: String,
    publishers: HashMap<AuthorizeKeyMethod, Arc<dyn KeyPublisher>>,
    cache: DashMap<(InstanceLocator, String), AuthorizedKey>,
}

impl KeyAuthorizer {
    /// Create an authorizer acting for `account` (an email address)
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            publishers: HashMap::new(),
            cache: DashMap::new(),
        }
    }

    /// Register the publisher for its method, replacing any previous one
    pub fn with_publisher(mut self, publisher: Arc<dyn KeyPublisher>) -> Self {
        self.publishers.insert(publisher.method(), publisher);
        self
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Username used when no principal hint is supplied
    pub fn default_username(&self) -> String {
        generate_username(&self.account)
    }

    /// Number of remembered publications
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Withdraw a key published by [`authorize_key`](Self::authorize_key)
    ///
    /// The publication is forgotten even when its method cannot withdraw
    /// keys; such keys stay valid until they expire.
    pub async fn revoke(&self, instance: &InstanceLocator, authorized: &AuthorizedKey) {
        self.cache.remove(&(instance.clone(), authorized.key_id.clone()));

        let Some(publisher) = self.publishers.get(&authorized.method) else {
            return;
        };
        let request = PublishRequest {
            instance: instance.clone(),
            username: authorized.username.clone(),
            public_key: authorized.public_key.clone(),
            expires_at: authorized.expires_at,
        };
        match publisher.revoke(&request).await {
            PublishOutcome::Published => {
                tracing::debug!(
                    "Revoked {:?} key for {}@{}",
                    authorized.method,
                    authorized.username,
                    instance
                );
            }
            PublishOutcome::ConstraintDenied(reason) => {
                tracing::debug!(
                    "{:?} key for {} not revoked: {}",
                    authorized.method,
                    instance,
                    reason
                );
            }
            PublishOutcome::Fault(cause) => {
                tracing::warn!(
                    "Revoking {:?} key for {} failed: {}",
                    authorized.method,
                    instance,
                    cause
                );
            }
        }
    }

    /// Publish `key` for `destination`, trying each allowed method in order.
    ///
    /// A publication cut short by `cancel` is treated as never having
    /// happened and is not remembered.
    pub async fn authorize_key(
        &self,
        destination: &Destination,
        key: &SshKey,
        validity: Duration,
        principal_hint: Option<&str>,
        methods: AuthorizeKeyMethods,
        cancel: &CancellationToken,
    ) -> Result<AuthorizedKey, AuthorizationError> {
        if methods.is_empty() {
            return Err(AuthorizationError::NoMethods);
        }
        if cancel.is_cancelled() {
            return Err(AuthorizationError::Cancelled);
        }

        let username = match principal_hint {
            Some(hint) if !hint.is_empty() => hint.to_string(),
            _ => self.default_username(),
        };
        let cache_key = (destination.instance.clone(), key.id().to_string());

        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.username == username
                && methods.contains(cached.method)
                && !expires_within(cached.expires_at, REUSE_MARGIN)
            {
                tracing::debug!(
                    "Reusing {:?} publication of {} for {}",
                    cached.method,
                    key.fingerprint(),
                    destination.instance
                );
                return Ok(cached.clone());
            }
        }

        let request = PublishRequest {
            instance: destination.instance.clone(),
            username: username.clone(),
            public_key: key.public_key_openssh(),
            expires_at: expiry_from_now(validity),
        };

        let mut attempted = Vec::new();
        let mut last_failure = None;

        for method in methods.iter() {
            attempted.push(method);

            let outcome = match self.publishers.get(&method) {
                Some(publisher) => {
                    // A publication that already finished counts as done.
                    tokio::select! {
                        biased;
                        outcome = publisher.publish(&request) => outcome,
                        _ = cancel.cancelled() => {
                            tracing::debug!("Key authorization for {} cancelled", destination);
                            return Err(AuthorizationError::Cancelled);
                        }
                    }
                }
                None => PublishOutcome::Fault(format!("no publisher configured for {:?}", method)),
            };

            match outcome {
                PublishOutcome::Published => {
                    let authorized = AuthorizedKey {
                        public_key: request.public_key.clone(),
                        key_id: key.id().to_string(),
                        username,
                        expires_at: request.expires_at,
                        method,
                    };
                    tracing::info!(
                        "Authorized key {} for {}@{} via {:?}",
                        key.fingerprint(),
                        authorized.username,
                        destination.instance,
                        method
                    );
                    self.cache
                        .retain(|_, cached| !expires_within(cached.expires_at, REUSE_MARGIN));
                    self.cache.insert(cache_key, authorized.clone());
                    return Ok(authorized);
                }
                PublishOutcome::ConstraintDenied(cause) => {
                    tracing::debug!("{:?} not permitted for {}: {}", method, destination, cause);
                    last_failure = Some((method, cause, true));
                }
                PublishOutcome::Fault(cause) => {
                    tracing::warn!("{:?} failed for {}: {}", method, destination, cause);
                    last_failure = Some((method, cause, false));
                }
            }
        }

        match last_failure {
            Some((last_method, last_cause, constraint)) => Err(AuthorizationError::Exhausted {
                attempted,
                last_method,
                last_cause,
                constraint,
            }),
            None => Err(AuthorizationError::NoMethods),
        }
    }
}

/// Derive a POSIX username from an account email.
pub fn generate_username(email: &str) -> String {
    let local = email.split('@').next().unwrap_or("");
    let mut name: String = local
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() {
        return "user".to_string();
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, 'g');
    }
    name.chars().take(MAX_USERNAME_LEN).collect()
}
