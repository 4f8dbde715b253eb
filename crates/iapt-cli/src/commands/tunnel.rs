//! Tunnel command implementation

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;

use iapt_core::config::IaptConfig;
use iapt_core::error::ConnectError;
use iapt_core::Destination;
use iapt_tunnel::{AllowAllPolicy, TcpRelayDialer, TunnelBroker, TunnelEvent};

use crate::output::{
    format_tunnels, print_connect_error, print_error, print_info, print_success, print_warning,
};

/// Open a tunnel and keep it until Ctrl+C or until its connection ends
///
/// Any local process may use the tunnel, so an external SSH client can be
/// pointed at the printed port.
pub async fn tunnel_command(config: &IaptConfig, destination: Destination) -> Result<()> {
    let relay = &config.connection.relay;
    let dialer = Arc::new(TcpRelayDialer::new(relay.address.clone()));
    let broker = TunnelBroker::from_settings(dialer, relay);

    print_info(&format!("Opening tunnel to {} via {}...", destination, relay.address));

    let tunnel = match broker
        .connect(
            &destination,
            Arc::new(AllowAllPolicy),
            config.connection.connection_timeout,
        )
        .await
    {
        Ok(tunnel) => tunnel,
        Err(e) => {
            let error = ConnectError::from(e);
            print_connect_error(&error);
            return Err(error.into());
        }
    };

    print_success(&format!(
        "Listening on {} (Press Ctrl+C to close)",
        tunnel.local_addr()
    ));
    println!("{}", format_tunnels(&broker.list()));

    let mut events = tunnel.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_info("Closing tunnel");
                broker.close(&tunnel);
                break;
            }
            _ = tunnel.closed() => break,
            event = events.recv() => match event {
                Ok(TunnelEvent::ConnectionAccepted { peer }) => {
                    print_info(&format!("Relaying connection from {}", peer));
                }
                Ok(TunnelEvent::ConnectionRejected { error }) => print_warning(&error.to_string()),
                Ok(TunnelEvent::Failed { reason }) => print_error(&reason),
                Ok(TunnelEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => continue,
            },
        }
    }

    print_success(&format!("Tunnel to {} closed", destination));
    Ok(())
}
