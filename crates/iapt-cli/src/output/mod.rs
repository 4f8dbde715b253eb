//! Output formatting utilities for the CLI
//!
//! Tables for tunnels, sessions and algorithms, plus colored status lines.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{settings::Style, Table, Tabled};

use iapt_core::error::ConnectError;
use iapt_core::AlgorithmCategory;
use iapt_orchestrator::SessionInfo;
use iapt_ssh::AlgorithmCatalog;
use iapt_tunnel::TunnelInfo;

/// Format tunnels as an ASCII table
pub fn format_tunnels(tunnels: &[TunnelInfo]) -> String {
    if tunnels.is_empty() {
        return "No open tunnels".to_string();
    }

    #[derive(Tabled)]
    struct TunnelRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "DESTINATION")]
        destination: String,
        #[tabled(rename = "LOCAL PORT")]
        port: u16,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "POLICY")]
        policy: String,
        #[tabled(rename = "ACTIVE")]
        active: usize,
        #[tabled(rename = "SERVED")]
        served: usize,
    }

    let rows: Vec<TunnelRow> = tunnels
        .iter()
        .map(|t| TunnelRow {
            id: truncate(&t.id.to_string(), 8),
            destination: t.destination.to_string(),
            port: t.local_port,
            state: t.state.to_string(),
            policy: t.policy.to_string(),
            active: t.active_connections,
            served: t.served_connections,
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format sessions as an ASCII table
pub fn format_sessions(sessions: &[SessionInfo]) -> String {
    if sessions.is_empty() {
        return "No active sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "SESSION")]
        id: String,
        #[tabled(rename = "DESTINATION")]
        destination: String,
        #[tabled(rename = "USER")]
        username: String,
        #[tabled(rename = "KEY METHOD")]
        method: String,
        #[tabled(rename = "LOCAL PORT")]
        port: u16,
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            id: truncate(&s.session_id.to_string(), 8),
            destination: s.destination.to_string(),
            username: s.username.clone(),
            method: s.method.to_string(),
            port: s.local_port,
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format the algorithm catalog, one row per algorithm
pub fn format_algorithms(catalog: &AlgorithmCatalog, categories: &[AlgorithmCategory]) -> String {
    #[derive(Tabled)]
    struct AlgorithmRow {
        #[tabled(rename = "CATEGORY")]
        category: String,
        #[tabled(rename = "ALGORITHM")]
        name: String,
    }

    let rows: Vec<AlgorithmRow> = categories
        .iter()
        .flat_map(|category| {
            catalog.get(*category).iter().map(move |name| AlgorithmRow {
                category: category.to_string(),
                name: name.clone(),
            })
        })
        .collect();

    if rows.is_empty() {
        return "No algorithms available".to_string();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

/// Report a failed connection with its remediation hint
pub fn print_connect_error(error: &ConnectError) {
    print_error(&error.user_message());
    if let Some(topic) = error.hint() {
        print_info(&format!("See: {}", topic));
    }
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}

fn print_tagged(mut out: impl std::io::Write, color: Color, tag: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(tag),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Green checkmark line on stdout
pub fn print_success(msg: &str) {
    print_tagged(std::io::stdout(), Color::Green, "✓ ", msg);
}

/// Red cross line on stderr
pub fn print_error(msg: &str) {
    print_tagged(std::io::stderr(), Color::Red, "✗ ", msg);
}

/// Yellow warning line on stderr
pub fn print_warning(msg: &str) {
    print_tagged(std::io::stderr(), Color::Yellow, "⚠ ", msg);
}

/// Cyan info line on stdout
pub fn print_info(msg: &str) {
    print_tagged(std::io::stdout(), Color::Cyan, "ℹ ", msg);
}
