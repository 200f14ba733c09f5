#![forbid(unsafe_code)]

//! # shat
//!
//! SSH terminal server. Every client gets a prompt; each line it sends is
//! echoed back as `server: <line>`.
//!
//! ## Usage
//!
//! ```bash
//! shat --key ~/.ssh/id_ed25519 --ops ./operators --restricted --motd ./motd.txt
//! ssh -p 1337 localhost
//! ```

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shat_sshd::{
    AccessList, Listener, ServerBuilder, ServerOptions, TerminalSession, expand_tilde,
    load_authorized_keys,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, PASSPHRASE_ENV};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = build_options(&cli, std::env::var(PASSPHRASE_ENV).ok())?;
    let policy = build_policy(&cli)?;
    let motd = match &cli.motd {
        Some(path) => Some(read_motd(path)?),
        None => None,
    };

    let listener = Listener::bind(options, Arc::new(policy))
        .await
        .context("failed to start listener")?;
    let mut terminals = listener.serve_terminals()?;
    info!(address = %listener.local_addr(), "Serving terminals");

    loop {
        tokio::select! {
            term = terminals.next() => match term {
                Some(term) => {
                    tokio::spawn(echo(term, motd.clone()));
                }
                None => break,
            },
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    listener.close()?;
    Ok(())
}

/// Builds listener options from the command line.
fn build_options(cli: &Cli, passphrase: Option<String>) -> anyhow::Result<ServerOptions> {
    let mut builder = ServerBuilder::new().address(cli.address.clone());
    if let Some(key) = &cli.key {
        builder = builder.host_key_path(expand_tilde(key));
    }
    if let Some(passphrase) = passphrase {
        builder = builder.host_key_passphrase(passphrase);
    }
    Ok(builder.build()?)
}

/// Allows everyone not banned; with `--restricted` only the operators from
/// `--ops` get in.
fn build_policy(cli: &Cli) -> anyhow::Result<AccessList> {
    let policy = AccessList::new().restricted(cli.restricted);
    if let Some(path) = &cli.ops {
        let keys = load_authorized_keys(path)
            .with_context(|| format!("failed to load operators from {}", path.display()))?;
        for authorized in keys {
            policy.add_operator(authorized.key);
        }
        info!(
            count = policy.operator_count(),
            restricted = cli.restricted,
            "Loaded operators"
        );
    }
    Ok(policy)
}

fn read_motd(path: &Path) -> anyhow::Result<Arc<str>> {
    let path = expand_tilde(path);
    let mut motd = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read motd from {}", path.display()))?;
    if !motd.is_empty() && !motd.ends_with('\n') {
        motd.push('\n');
    }
    Ok(motd.into())
}

/// Echoes every line until the client leaves.
async fn echo(term: TerminalSession, motd: Option<Arc<str>>) {
    let connection_id = term.id();
    info!(connection_id, user = %term.user(), "Session started");

    if let Some(motd) = motd
        && term.write_str(&motd).await.is_err()
    {
        return;
    }
    term.set_prompt("> ");

    loop {
        match term.read_line().await {
            Ok(Some(line)) => {
                debug!(connection_id, line = %line, "Received line");
                if term.write_line(&format!("server: {line}")).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(connection_id, error = %e, "Read failed");
                break;
            }
        }
    }

    let _ = term.close();
    info!(connection_id, "Session ended");
}
