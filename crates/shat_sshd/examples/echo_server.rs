//! Line echo server.
//!
//! Accepts every client, shows a prompt, and echoes each line back in
//! upper case until the client types `exit` or presses Ctrl-D.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example echo_server
//! ```
//!
//! Then connect with:
//!
//! ```bash
//! ssh -p 2222 -o StrictHostKeyChecking=no localhost
//! ```

use std::sync::Arc;
use std::time::Duration;

use shat_sshd::{Listener, OpenPolicy, ServerBuilder, TerminalSession};

#[tokio::main]
async fn main() -> Result<(), shat_sshd::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let options = ServerBuilder::new()
        .address("127.0.0.1:2222")
        .version("SSH-2.0-ShatEcho")
        .banner("Welcome to the echo server!\n")
        .idle_timeout(Duration::from_secs(300))
        .prompt("echo> ")
        .build()?;

    let listener = Listener::bind(options, Arc::new(OpenPolicy)).await?;
    let mut terminals = listener.serve_terminals()?;
    tracing::info!("Connect with: ssh -p 2222 -o StrictHostKeyChecking=no localhost");

    while let Some(term) = terminals.next().await {
        tokio::spawn(shout(term));
    }
    Ok(())
}

async fn shout(term: TerminalSession) {
    let greeting = format!("Hello {}, from {}", term.user(), term.remote_addr());
    if term.write_line(&greeting).await.is_err() {
        return;
    }

    while let Ok(Some(line)) = term.read_line().await {
        if line.trim() == "exit" {
            break;
        }
        if term.write_line(&line.to_uppercase()).await.is_err() {
            return;
        }
    }

    let _ = term.write_line("Goodbye!").await;
    let _ = term.close();
}
