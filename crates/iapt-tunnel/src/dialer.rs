//! Relay dialers
//!
//! A dialer opens one remote channel to a destination through the relay.
//! The broker only sees the channel as an async byte stream.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use iapt_core::Destination;

/// Longest response line accepted from the relay
const MAX_RESPONSE_LINE: u64 = 512;

/// Byte stream carrying one remote channel
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased relay channel
pub type BoxedRelayStream = Box<dyn RelayStream>;

/// Failure to open a relay channel
#[derive(Error, Debug, Clone)]
pub enum DialError {
    /// The relay refused to tunnel to the destination
    #[error("relay denied access: {0}")]
    Denied(String),

    /// The relay, or the instance behind it, could not be reached
    #[error("relay unreachable: {0}")]
    Unreachable(String),
}

/// Opens remote channels through the relay
#[async_trait]
pub trait RelayDialer: Send + Sync {
    /// Open a channel to `destination`
    async fn dial(&self, destination: &Destination) -> Result<BoxedRelayStream, DialError>;
}

/// Dialer for a line-oriented TCP relay
///
/// The dialer writes `CONNECT <project>/<zone>/<instance>:<port>` and waits
/// for a single status line. `OK` hands the connection over as the channel,
/// `DENIED` means the caller is not authorized, and anything else (including
/// EOF) means the relay could not reach the instance.
#[derive(Debug, Clone)]
pub struct TcpRelayDialer {
    relay_addr: String,
}

impl TcpRelayDialer {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
        }
    }

    /// Relay address this dialer connects to
    pub fn relay_addr(&self) -> &str {
        &self.relay_addr
    }
}

fn connect_header(destination: &Destination) -> String {
    let instance = &destination.instance;
    format!(
        "CONNECT {}/{}/{}:{}\n",
        instance.project, instance.zone, instance.name, destination.port
    )
}

#[async_trait]
impl RelayDialer for TcpRelayDialer {
    async fn dial(&self, destination: &Destination) -> Result<BoxedRelayStream, DialError> {
        tracing::debug!("Dialing relay {} for {}", self.relay_addr, destination);

        let stream = TcpStream::connect(&self.relay_addr)
            .await
            .map_err(|e| DialError::Unreachable(format!("{}: {}", self.relay_addr, e)))?;
        stream.set_nodelay(true).ok();

        let mut stream = BufReader::new(stream);
        stream
            .get_mut()
            .write_all(connect_header(destination).as_bytes())
            .await
            .map_err(|e| DialError::Unreachable(format!("sending request: {}", e)))?;

        let mut line = String::new();
        let n = (&mut stream)
            .take(MAX_RESPONSE_LINE)
            .read_line(&mut line)
            .await
            .map_err(|e| DialError::Unreachable(format!("reading response: {}", e)))?;
        if n == 0 {
            return Err(DialError::Unreachable(
                "relay closed the connection".to_string(),
            ));
        }

        let status = line.trim_end();
        if status == "OK" {
            tracing::debug!("Relay accepted channel to {}", destination);
            // The BufReader is kept so bytes that arrived with the status line are not lost.
            return Ok(Box::new(stream));
        }

        match status.strip_prefix("DENIED") {
            Some(reason) => Err(DialError::Denied(denial_reason(reason))),
            None => Err(DialError::Unreachable(format!(
                "unexpected relay response: {:?}",
                status
            ))),
        }
    }
}

fn denial_reason(rest: &str) -> String {
    let rest = rest.trim();
    if rest.is_empty() {
        "access denied".to_string()
    } else {
        rest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iapt_core::InstanceLocator;
    use tokio::net::TcpListener;

    fn destination() -> Destination {
        Destination::new(InstanceLocator::new("proj", "zone-a", "vm-1"), 22)
    }

    /// Relay that answers the request line with `reply` and then echoes
    async fn fake_relay(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut request = String::new();
            socket.read_line(&mut request).await.unwrap();
            socket.get_mut().write_all(reply.as_bytes()).await.unwrap();

            let mut buf = [0u8; 64];
            if let Ok(n) = socket.read(&mut buf).await {
                if n > 0 {
                    socket.get_mut().write_all(&buf[..n]).await.unwrap();
                }
            }
            request
        });
        (addr, handle)
    }

    #[test]
    fn test_connect_header() {
        assert_eq!(connect_header(&destination()), "CONNECT proj/zone-a/vm-1:22\n");
    }

    #[tokio::test]
    async fn test_ok_hands_over_channel() {
        let (addr, relay) = fake_relay("OK\n").await;
        let dialer = TcpRelayDialer::new(addr);

        let mut channel = dialer.dial(&destination()).await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(relay.await.unwrap(), "CONNECT proj/zone-a/vm-1:22\n");
    }

    #[tokio::test]
    async fn test_bytes_after_status_line_are_kept() {
        let (addr, _relay) = fake_relay("OK\nSSH-2.0-test\r\n").await;
        let dialer = TcpRelayDialer::new(addr);

        let mut channel = dialer.dial(&destination()).await.unwrap();
        let mut buf = [0u8; 14];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");
    }

    #[tokio::test]
    async fn test_denied_maps_to_denied() {
        let (addr, _relay) = fake_relay("DENIED missing tunnel role\n").await;
        let result = TcpRelayDialer::new(addr).dial(&destination()).await;
        match result {
            Err(DialError::Denied(reason)) => assert_eq!(reason, "missing tunnel role"),
            Err(other) => panic!("expected denial, got {:?}", other),
            Ok(_) => panic!("expected denial, got a channel"),
        }
    }

    #[tokio::test]
    async fn test_other_response_is_unreachable() {
        let (addr, _relay) = fake_relay("UNREACHABLE\n").await;
        let result = TcpRelayDialer::new(addr).dial(&destination()).await;
        assert!(matches!(result, Err(DialError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_closed_relay_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let result = TcpRelayDialer::new(addr).dial(&destination()).await;
        assert!(matches!(result, Err(DialError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpRelayDialer::new(addr).dial(&destination()).await;
        assert!(matches!(result, Err(DialError::Unreachable(_))));
    }
}
