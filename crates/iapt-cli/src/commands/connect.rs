//! Connect command implementation

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use iapt_core::config::{self, IaptConfig};
use iapt_core::{InstanceLocator, ResourceNode};
use iapt_orchestrator::{
    AuthorizedKeysFilePublisher, ConnectionOrchestrator, FileKeyProvider, KeyAuthorizer,
};
use iapt_ssh::{TraceHandler, TraceMask};
use iapt_tunnel::{TcpRelayDialer, TunnelBroker};

use crate::output::{format_sessions, print_connect_error, print_info, print_success};

/// Overrides given on the command line
#[derive(Debug, Default)]
pub struct ConnectOptions {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
    pub trace: bool,
    pub json: bool,
}

/// Execute the connect command - authenticate and hold the session until Ctrl+C
pub async fn connect_command(
    config: &IaptConfig,
    instance: InstanceLocator,
    options: ConnectOptions,
) -> Result<()> {
    let orchestrator = build_orchestrator(config, &options);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    print_info(&format!("Connecting to {}...", instance));
    let node = ResourceNode::Instance(instance);

    let session = match orchestrator.connect(&node, &cancel).await {
        Ok(session) => session,
        Err(e) => {
            interrupt.abort();
            print_connect_error(&e);
            return Err(e.into());
        }
    };

    print_success(&format!("Session {} authenticated", session.id()));
    let sessions = orchestrator.sessions();
    if options.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        println!("{}", format_sessions(&sessions));
    }

    print_info("Press Ctrl+C to disconnect");
    cancel.cancelled().await;

    orchestrator.close_all().await;
    print_success("Disconnected");
    Ok(())
}

fn build_orchestrator(config: &IaptConfig, options: &ConnectOptions) -> ConnectionOrchestrator {
    let mut settings = config.connection.clone();
    if let Some(port) = options.port {
        settings.ssh_port = port;
    }
    if let Some(user) = &options.user {
        settings.ssh_username = Some(user.clone());
    }

    let account = config
        .account
        .clone()
        .unwrap_or_else(|| format!("{}@localhost", whoami::username()));
    let authorized_keys = config
        .authorized_keys
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join("authorized_keys"));

    let dialer = Arc::new(TcpRelayDialer::new(settings.relay.address.clone()));
    let broker = Arc::new(TunnelBroker::from_settings(dialer, &settings.relay));
    let authorizer = Arc::new(
        KeyAuthorizer::new(account)
            .with_publisher(Arc::new(AuthorizedKeysFilePublisher::new(authorized_keys))),
    );

    let mut orchestrator = ConnectionOrchestrator::new(broker, authorizer, settings);

    if let Some(path) = options.identity.clone().or_else(|| config.identity_file.clone()) {
        orchestrator = orchestrator.with_key_provider(Arc::new(FileKeyProvider::new(path)));
    }
    if options.trace {
        let handler: TraceHandler = Arc::new(|category: TraceMask, message: &str| {
            tracing::info!(target: "iapt::trace", "{:?} {}", category, message);
        });
        orchestrator = orchestrator.with_trace_handler(TraceMask::ALL, handler);
    }

    orchestrator
}

