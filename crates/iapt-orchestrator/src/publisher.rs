//! Key publishers
//!
//! A publisher registers a public key through one authorization mechanism.
//! "This mechanism is not allowed here" is an ordinary outcome, not an
//! error, so the authorizer can move on to the next method.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use iapt_core::time::format_utc_compact;
use iapt_core::{AuthorizeKeyMethod, InstanceLocator};

/// What to publish
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub instance: InstanceLocator,
    /// Account the key logs in as
    pub username: String,
    /// Key in `authorized_keys` format (`<algorithm> <base64>`)
    pub public_key: String,
    /// Unix timestamp after which the key must no longer be accepted
    pub expires_at: u64,
}

/// Result of one publication attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The key is registered and valid until the requested expiry
    Published,
    /// The method is not permitted for this instance or caller
    ConstraintDenied(String),
    /// The method is permitted but the write failed
    Fault(String),
}

/// Registers keys through one authorization method
#[async_trait]
pub trait KeyPublisher: Send + Sync {
    fn method(&self) -> AuthorizeKeyMethod;

    async fn publish(&self, request: &PublishRequest) -> PublishOutcome;

    /// Withdraw a key published earlier with the same request
    ///
    /// `Published` means the key is gone. Mechanisms that cannot withdraw
    /// keys leave them to expire.
    async fn revoke(&self, _request: &PublishRequest) -> PublishOutcome {
        PublishOutcome::ConstraintDenied("left to expire".to_string())
    }
}

/// Publishes keys into an OpenSSH `authorized_keys` file
///
/// Each key gets an `expiry-time` option so sshd stops accepting it once the
/// validity window has passed. Republishing a key for the same user and
/// instance replaces its line.
///
/// Edits to one file are serialized across every publisher in the process,
/// and each edit replaces the file by renaming a complete copy over it, so
/// an edit that is abandoned halfway leaves the previous content in place.
#[derive(Debug, Clone)]
pub struct AuthorizedKeysFilePublisher {
    path: PathBuf,
    method: AuthorizeKeyMethod,
}

impl AuthorizedKeysFilePublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            method: AuthorizeKeyMethod::Metadata,
        }
    }

    /// Report a different method for this publisher
    pub fn with_method(mut self, method: AuthorizeKeyMethod) -> Self {
        self.method = method;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `edit` to the file content under the file's lock
    ///
    /// The lock guard moves into the blocking task, so the next edit waits
    /// for this one even if the calling future is dropped.
    async fn update<F>(&self, edit: F) -> std::io::Result<()>
    where
        F: FnOnce(&str) -> Option<String> + Send + 'static,
    {
        let guard = file_lock(&self.path).lock_owned().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || rewrite(guard, &path, edit))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    fn outcome(&self, result: std::io::Result<()>) -> PublishOutcome {
        match result {
            Ok(()) => PublishOutcome::Published,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                PublishOutcome::ConstraintDenied(format!("{}: {}", self.path.display(), e))
            }
            Err(e) => PublishOutcome::Fault(format!("{}: {}", self.path.display(), e)),
        }
    }
}

/// Process-wide lock per `authorized_keys` path
fn file_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(DashMap::new);
    Arc::clone(locks.entry(path.to_path_buf()).or_default().value())
}

/// Replace `path` with `edit(current content)`; `None` leaves it untouched
fn rewrite<F>(_guard: OwnedMutexGuard<()>, path: &Path, edit: F) -> std::io::Result<()>
where
    F: FnOnce(&str) -> Option<String>,
{
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let Some(content) = edit(&existing) else {
        return Ok(());
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(content.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn key_comment(request: &PublishRequest) -> String {
    format!("{}@{}", request.username, request.instance.name)
}

/// True for the line carrying this request's key for its user and instance
fn is_entry_for(line: &str, blob: &str, comment: &str) -> bool {
    let mut fields = line.split_whitespace();
    fields.clone().any(|field| field == blob) && fields.next_back() == Some(comment)
}

fn authorized_keys_line(request: &PublishRequest) -> String {
    format!(
        "expiry-time=\"{}\" {} {}\n",
        format_utc_compact(request.expires_at),
        request.public_key,
        key_comment(request)
    )
}

fn key_blob(request: &PublishRequest) -> String {
    request
        .public_key
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl KeyPublisher for AuthorizedKeysFilePublisher {
    fn method(&self) -> AuthorizeKeyMethod {
        self.method
    }

    async fn publish(&self, request: &PublishRequest) -> PublishOutcome {
        let blob = key_blob(request);
        let comment = key_comment(request);
        let line = authorized_keys_line(request);

        let result = self
            .update(move |existing| {
                let mut content: String = existing
                    .lines()
                    .filter(|l| blob.is_empty() || !is_entry_for(l, &blob, &comment))
                    .map(|l| format!("{}\n", l))
                    .collect();
                content.push_str(&line);
                Some(content)
            })
            .await;

        let outcome = self.outcome(result);
        if outcome == PublishOutcome::Published {
            tracing::debug!("Published key for {} to {:?}", request.username, self.path);
        }
        outcome
    }

    async fn revoke(&self, request: &PublishRequest) -> PublishOutcome {
        let blob = key_blob(request);
        let comment = key_comment(request);

        let result = self
            .update(move |existing| {
                let kept: Vec<&str> = existing
                    .lines()
                    .filter(|l| !is_entry_for(l, &blob, &comment))
                    .collect();
                if kept.len() == existing.lines().count() {
                    return None;
                }
                Some(kept.iter().map(|l| format!("{}\n", l)).collect())
            })
            .await;

        let outcome = self.outcome(result);
        if outcome == PublishOutcome::Published {
            tracing::debug!("Revoked key for {} from {:?}", request.username, self.path);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(public_key: &str, expires_at: u64) -> PublishRequest {
        PublishRequest {
            instance: InstanceLocator::new("proj", "zone", "vm-1"),
            username: "alice".into(),
            public_key: public_key.into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_publish_writes_expiring_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".ssh").join("authorized_keys");
        let publisher = AuthorizedKeysFilePublisher::new(&path);

        let outcome = publisher.publish(&request("ssh-ed25519 AAAAkey1", 0)).await;
        assert_eq!(outcome, PublishOutcome::Published);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "expiry-time=\"197001010000\" ssh-ed25519 AAAAkey1 alice@vm-1\n"
        );
    }

    #[tokio::test]
    async fn test_republish_replaces_line_and_keeps_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, "ssh-rsa AAAAother bob@laptop\n").unwrap();
        let publisher = AuthorizedKeysFilePublisher::new(&path);

        publisher.publish(&request("ssh-ed25519 AAAAkey1", 0)).await;
        publisher.publish(&request("ssh-ed25519 AAAAkey1", 86_400)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "ssh-rsa AAAAother bob@laptop");
        assert!(lines[1].starts_with("expiry-time=\"197001020000\""));
    }

    #[tokio::test]
    async fn test_unwritable_path_is_fault() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        // A regular file where a directory is expected
        let publisher = AuthorizedKeysFilePublisher::new(blocker.join("authorized_keys"));

        let outcome = publisher.publish(&request("ssh-ed25519 AAAAkey1", 0)).await;
        assert!(matches!(outcome, PublishOutcome::Fault(_)));
    }

    #[tokio::test]
    async fn test_abandoned_publish_keeps_existing_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");
        let seeded: String = (0..20_000)
            .map(|i| format!("ssh-rsa AAAAseed{} user{}@host\n", i, i))
            .collect();
        std::fs::write(&path, &seeded).unwrap();
        let publisher = AuthorizedKeysFilePublisher::new(&path);

        for i in 0..20 {
            let req = request(&format!("ssh-ed25519 AAAAkey{}", i), 0);
            // Give up on the publish while it is likely mid-write.
            let _ = tokio::time::timeout(Duration::from_micros(200), publisher.publish(&req)).await;

            let content = std::fs::read_to_string(&path).unwrap();
            let seeds = content.lines().filter(|l| l.starts_with("ssh-rsa")).count();
            assert_eq!(seeds, 20_000, "iteration {}", i);
        }

        // Waits behind any edit still running.
        let last = publisher.publish(&request("ssh-ed25519 AAAAlast", 0)).await;
        assert_eq!(last, PublishOutcome::Published);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(&seeded));
        assert!(content.lines().any(|l| l.contains("AAAAlast")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_all_land() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                // Separate publishers for one file still share its lock.
                let publisher = AuthorizedKeysFilePublisher::new(&path);
                tokio::spawn(async move {
                    let mut req = request(&format!("ssh-ed25519 AAAAkey{}", i), 0);
                    req.instance = InstanceLocator::new("proj", "zone", &format!("vm-{}", i));
                    publisher.publish(&req).await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), PublishOutcome::Published);
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 16);
        for i in 0..16 {
            assert!(content.contains(&format!("AAAAkey{} alice@vm-{}\n", i, i)));
        }
    }

    #[tokio::test]
    async fn test_revoke_removes_only_matching_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, "ssh-ed25519 AAAAkey1 bob@laptop\n").unwrap();
        let publisher = AuthorizedKeysFilePublisher::new(&path);

        let vm1 = request("ssh-ed25519 AAAAkey1", 0);
        let mut vm2 = vm1.clone();
        vm2.instance = InstanceLocator::new("proj", "zone", "vm-2");
        publisher.publish(&vm1).await;
        publisher.publish(&vm2).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);

        assert_eq!(publisher.revoke(&vm1).await, PublishOutcome::Published);
        assert_eq!(publisher.revoke(&vm1).await, PublishOutcome::Published);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "ssh-ed25519 AAAAkey1 bob@laptop");
        assert!(lines[1].ends_with("alice@vm-2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");
        AuthorizedKeysFilePublisher::new(&path)
            .publish(&request("ssh-ed25519 AAAAkey1", 0))
            .await;

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_method_override() {
        let publisher =
            AuthorizedKeysFilePublisher::new("keys").with_method(AuthorizeKeyMethod::OsLogin);
        assert_eq!(publisher.method(), AuthorizeKeyMethod::OsLogin);
    }
}
