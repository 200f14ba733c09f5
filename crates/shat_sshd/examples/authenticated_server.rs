//! Operators-only server.
//!
//! Only keys listed in `~/.ssh/authorized_keys` may connect. Typing `whoami`
//! prints the key fingerprint the client authenticated with.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example authenticated_server
//! ssh -p 2222 -o StrictHostKeyChecking=no localhost
//! ```

use std::sync::Arc;

use shat_sshd::{AccessList, Listener, ServerBuilder, TerminalSession, load_authorized_keys};

#[tokio::main]
async fn main() -> Result<(), shat_sshd::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let operators = load_authorized_keys("~/.ssh/authorized_keys")?;
    let policy = AccessList::new()
        .restricted(true)
        .with_operators(operators.into_iter().map(|authorized| authorized.key));
    tracing::info!(operators = policy.operator_count(), "Loaded operator keys");

    let options = ServerBuilder::new().address("127.0.0.1:2222").build()?;
    let listener = Listener::bind(options, Arc::new(policy)).await?;
    let mut terminals = listener.serve_terminals()?;

    while let Some(term) = terminals.next().await {
        tokio::spawn(serve(term));
    }
    Ok(())
}

async fn serve(term: TerminalSession) {
    while let Ok(Some(line)) = term.read_line().await {
        let reply = match line.trim() {
            "whoami" => match term.public_key() {
                Some(key) => format!("{} ({})", term.user(), key.fingerprint()),
                None => term.user().to_string(),
            },
            "" => continue,
            other => format!("unknown command: {other}"),
        };
        if term.write_line(&reply).await.is_err() {
            break;
        }
    }
}
