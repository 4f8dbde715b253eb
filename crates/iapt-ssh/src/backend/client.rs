//! russh-backed transport

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{Disconnect, Preferred, SshId};
use russh_keys::key::{KeyPair, PublicKey};

use iapt_core::error::{TransportError, TransportErrorCode};
use iapt_core::AlgorithmCategory;

use super::{BoxedTransportStream, HandshakeOptions, NativeSession, TransportBackend};
use crate::trace::{TraceMask, TraceSlot};
use crate::transport::{self, AlgorithmCatalog};

/// Pseudo-algorithms that announce protocol extensions rather than name a kex method
const KEX_EXTENSION_PREFIXES: [&str; 2] = ["ext-info-", "kex-strict-"];

/// Transport backend built on russh
#[derive(Debug, Clone, Copy, Default)]
pub struct RusshBackend;

#[async_trait]
impl TransportBackend for RusshBackend {
    fn name(&self) -> &'static str {
        "russh"
    }

    fn supported_algorithms(&self, category: AlgorithmCategory) -> Vec<String> {
        transport::initialize()
            .map(|catalog| catalog.get(category).to_vec())
            .unwrap_or_default()
    }

    async fn handshake(
        &self,
        stream: BoxedTransportStream,
        options: HandshakeOptions,
        trace: TraceSlot,
    ) -> Result<Box<dyn NativeSession>, TransportError> {
        let mut config = Config {
            preferred: preferred(&options.preferred),
            ..Default::default()
        };
        if let Some(banner) = options.banner {
            config.client_id = SshId::Standard(format!("SSH-2.0-{}", banner));
        }

        trace.emit(TraceMask::TRANSPORT, "starting version exchange");
        let handler = SessionHandler {
            trace: trace.clone(),
        };

        let handle = client::connect_stream(Arc::new(config), stream, handler)
            .await
            .map_err(|e| {
                let code = error_code(&e);
                trace.emit(TraceMask::ERROR, &format!("handshake failed: {}", e));
                TransportError::NegotiationFailed {
                    code,
                    message: e.to_string(),
                }
            })?;

        trace.emit(TraceMask::KEX, "key exchange complete");
        Ok(Box::new(RusshSession {
            handle,
            trace,
        }))
    }
}

struct RusshSession {
    handle: Handle<SessionHandler>,
    trace: TraceSlot,
}

#[async_trait]
impl NativeSession for RusshSession {
    async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: Arc<KeyPair>,
    ) -> Result<bool, TransportError> {
        self.trace.emit(
            TraceMask::AUTH,
            &format!("trying public key authentication for {}", username),
        );
        self.handle
            .authenticate_publickey(username, key)
            .await
            .map_err(|e| TransportError::Native {
                code: error_code(&e),
                message: e.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.trace.emit(TraceMask::CONNECTION, "disconnecting");
        self.handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
            .map_err(|e| TransportError::Native {
                code: error_code(&e),
                message: e.to_string(),
            })
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Client handler forwarding host key details to the trace slot
struct SessionHandler {
    trace: TraceSlot,
}

#[async_trait]
impl client::Handler for SessionHandler {
    type Error = russh::Error;

    /// The tunnel already authenticates the instance, so any host key is accepted
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {} {}", server_public_key.name(), fingerprint);
        self.trace.emit(
            TraceMask::KEX,
            &format!("server host key {} {}", server_public_key.name(), fingerprint),
        );
        Ok(true)
    }
}

/// Map a russh error onto the native code taxonomy
fn error_code(error: &russh::Error) -> TransportErrorCode {
    match error {
        russh::Error::IO(_) => TransportErrorCode::SocketRecv,
        russh::Error::Disconnect | russh::Error::HUP => TransportErrorCode::SocketDisconnect,
        russh::Error::ConnectionTimeout => TransportErrorCode::Timeout,
        russh::Error::NoCommonKexAlgo
        | russh::Error::NoCommonKeyAlgo
        | russh::Error::NoCommonCipher => TransportErrorCode::KexFailure,
        _ => TransportErrorCode::Protocol,
    }
}

/// Catalog of algorithms russh implements
pub(crate) fn build_catalog() -> AlgorithmCatalog {
    let default = Preferred::DEFAULT;
    let compressed = Preferred::COMPRESSED;

    AlgorithmCatalog {
        kex: names(&default.kex, &compressed.kex),
        host_key: names(&default.key, &compressed.key),
        cipher: names(&default.cipher, &compressed.cipher),
        mac: names(&default.mac, &compressed.mac),
        compression: names(&default.compression, &compressed.compression),
    }
}

fn names<N: AsRef<str>>(first: &[N], second: &[N]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in first.iter().chain(second.iter()) {
        let name = name.as_ref();
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

/// Build russh preferences from configured names
fn preferred(prefs: &iapt_core::config::AlgorithmPreferences) -> Preferred {
    let default = Preferred::DEFAULT;
    let compressed = Preferred::COMPRESSED;

    let mut kex = select(&default.kex, &compressed.kex, &prefs.kex);
    // Extension markers must survive an explicit kex list.
    for marker in default.kex.iter() {
        let name = marker.as_ref();
        if KEX_EXTENSION_PREFIXES.iter().any(|p| name.starts_with(p))
            && !kex.iter().any(|k| k.as_ref() == name)
        {
            kex.push(*marker);
        }
    }

    Preferred {
        kex: Cow::Owned(kex),
        key: Cow::Owned(select(&default.key, &compressed.key, &prefs.host_key)),
        cipher: Cow::Owned(select(&default.cipher, &compressed.cipher, &prefs.cipher)),
        mac: Cow::Owned(select(&default.mac, &compressed.mac, &prefs.mac)),
        compression: Cow::Owned(select(
            &default.compression,
            &compressed.compression,
            &prefs.compression,
        )),
        ..Preferred::DEFAULT
    }
}

/// Pick `wanted` names in order from the known set, falling back to the defaults
fn select<N: AsRef<str> + Copy>(defaults: &[N], extra: &[N], wanted: &[String]) -> Vec<N> {
    let picked: Vec<N> = wanted
        .iter()
        .filter_map(|w| {
            defaults
                .iter()
                .chain(extra.iter())
                .find(|n| n.as_ref() == w.as_str())
                .copied()
        })
        .collect();

    if picked.is_empty() {
        defaults.to_vec()
    } else {
        picked
    }
}
