//! Accepting connections and emitting terminal sessions.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use russh::server::{Config as RusshConfig, run_stream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{ConnectionHandler, ServerState};
use crate::{AcceptErrorPolicy, AuthPolicy, Error, Result, ServerOptions, TerminalSession};

/// A bound SSH listener.
///
/// Created with [`bind`](Self::bind); [`serve_terminals`](Self::serve_terminals)
/// starts accepting. Dropping the listener closes it.
pub struct Listener {
    local_addr: SocketAddr,
    socket: Mutex<Option<TcpListener>>,
    server_state: Arc<ServerState>,
    config: Arc<RusshConfig>,
    shutdown: CancellationToken,
    serving: AtomicBool,
}

impl Listener {
    /// Binds the address in `options`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddrParse`] for a malformed address,
    /// [`Error::Bind`] if the socket cannot be bound, and a key error if the
    /// configured host key cannot be loaded.
    pub async fn bind(options: ServerOptions, policy: Arc<dyn AuthPolicy>) -> Result<Self> {
        let addr: SocketAddr = options.address.parse()?;
        let config = create_russh_config(&options, policy.as_ref())?;

        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        info!(address = %local_addr, "Listening for SSH connections");

        Ok(Self {
            local_addr,
            socket: Mutex::new(Some(socket)),
            server_state: Arc::new(ServerState::new(options, policy)),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            serving: AtomicBool::new(false),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and returns the stream of negotiated
    /// sessions.
    ///
    /// The stream ends when the listener is closed or accepting fails under
    /// [`AcceptErrorPolicy::Terminate`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerClosed`] after [`close`](Self::close) and
    /// [`Error::AlreadyServing`] on a second call.
    pub fn serve_terminals(&self) -> Result<Terminals> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ListenerClosed);
        }
        if self.serving.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyServing);
        }
        let socket = self.socket.lock().take().ok_or(Error::ListenerClosed)?;

        let (sessions_tx, sessions_rx) = mpsc::channel(self.server_state.options.session_backlog);
        tokio::spawn(accept_loop(
            socket,
            sessions_tx,
            self.server_state.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        ));

        Ok(Terminals { rx: sessions_rx })
    }

    /// Stops accepting and ends the session stream.
    ///
    /// Connections still negotiating are disconnected; sessions already
    /// emitted stay usable. Calling `close` again has no effect.
    pub fn close(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            info!(address = %self.local_addr, "Closing listener");
            self.shutdown.cancel();
        }
        self.socket.lock().take();
        Ok(())
    }

    /// Returns true once the listener has been closed.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("serving", &self.serving.load(Ordering::Acquire))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stream of negotiated terminal sessions.
///
/// Sessions are buffered up to the configured backlog; while the buffer is
/// full the listener stops accepting.
#[derive(Debug)]
pub struct Terminals {
    rx: mpsc::Receiver<TerminalSession>,
}

impl Terminals {
    /// Waits for the next session, or `None` once the listener has stopped.
    pub async fn next(&mut self) -> Option<TerminalSession> {
        self.rx.recv().await
    }
}

impl Stream for Terminals {
    type Item = TerminalSession;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// -----------------------------------------------------------------------------
// Transport Configuration
// -----------------------------------------------------------------------------

/// Creates the russh server configuration.
fn create_russh_config(options: &ServerOptions, policy: &dyn AuthPolicy) -> Result<RusshConfig> {
    use russh::MethodSet;
    use russh_keys::key::KeyPair;

    let mut config = RusshConfig::default();

    config.server_id = russh::SshId::Standard(options.version.clone());
    config.inactivity_timeout = options.idle_timeout;
    config.max_auth_attempts = options.max_auth_attempts as usize;
    config.auth_rejection_time = options.auth_rejection_delay;

    let mut methods = MethodSet::PUBLICKEY;
    if policy.allow_anonymous() {
        methods |= MethodSet::NONE | MethodSet::KEYBOARD_INTERACTIVE;
    }
    config.methods = methods;

    let passphrase = options.host_key_passphrase.as_deref();
    let key = if let Some(ref pem) = options.host_key_pem {
        russh_keys::decode_secret_key(
            std::str::from_utf8(pem).map_err(|e| Error::Key(e.to_string()))?,
            passphrase,
        )?
    } else if let Some(ref path) = options.host_key_path {
        russh_keys::load_secret_key(path, passphrase)?
    } else {
        info!("Generating ephemeral Ed25519 host key");
        KeyPair::generate_ed25519()
    };
    config.keys.push(key);

    if let Some(ref banner) = options.banner {
        // russh wants &'static str; one banner per listener.
        let banner: &'static str = Box::leak(banner.clone().into_boxed_str());
        config.auth_banner = Some(banner);
    }

    Ok(config)
}

// -----------------------------------------------------------------------------
// Accept Loop
// -----------------------------------------------------------------------------

async fn accept_loop(
    socket: TcpListener,
    sessions: mpsc::Sender<TerminalSession>,
    server_state: Arc<ServerState>,
    config: Arc<RusshConfig>,
    shutdown: CancellationToken,
) {
    loop {
        // Stop accepting while the session buffer is full. The slot is not
        // held: connections still negotiating do not count against it.
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            permit = sessions.reserve() => if permit.is_err() {
                debug!("Session stream dropped");
                break;
            },
        }

        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            accepted = socket.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let connection_id = server_state.next_connection_id();
                info!(connection_id, peer_addr = %peer_addr, "Accepted connection");
                let connection = Connection {
                    connection_id,
                    peer_addr,
                    server_state: server_state.clone(),
                    config: config.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(connection.drive(stream, sessions.clone()));
            }
            Err(e) => {
                let Some(backoff) = retry_backoff(server_state.options.accept_error_policy, &e)
                else {
                    break;
                };
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Decides what follows a failed `accept`: `None` stops the loop.
fn retry_backoff(policy: AcceptErrorPolicy, error: &io::Error) -> Option<Duration> {
    match policy {
        AcceptErrorPolicy::Terminate => {
            error!(error = %error, "Failed to accept connection, stopping");
            None
        }
        AcceptErrorPolicy::Retry { backoff } => {
            warn!(error = %error, backoff = ?backoff, "Failed to accept connection");
            Some(backoff)
        }
    }
}

// -----------------------------------------------------------------------------
// Per-Connection Task
// -----------------------------------------------------------------------------

struct Connection {
    connection_id: u64,
    peer_addr: SocketAddr,
    server_state: Arc<ServerState>,
    config: Arc<RusshConfig>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Runs the handshake and negotiation, emits the session on `sessions`,
    /// then waits for the connection to end.
    async fn drive(self, stream: TcpStream, sessions: mpsc::Sender<TerminalSession>) {
        let connection_id = self.connection_id;
        let authenticated = Arc::new(AtomicBool::new(false));
        let (negotiated_tx, negotiated_rx) = oneshot::channel();
        let closed = CancellationToken::new();
        let handler = ConnectionHandler::new(
            connection_id,
            self.peer_addr,
            self.server_state.clone(),
            authenticated.clone(),
            negotiated_tx,
            closed.clone(),
        );

        let timeout = self.server_state.options.negotiation_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        debug!(connection_id, peer_addr = %self.peer_addr, "Running SSH session");
        let running = tokio::select! {
            started = run_stream(self.config.clone(), stream, handler) => match started {
                Ok(running) => running,
                Err(e) => {
                    self.fail(Error::Handshake(e.to_string()));
                    return;
                }
            },
            () = &mut expired => {
                self.fail(self.timed_out(&authenticated, timeout));
                return;
            }
            () = self.shutdown.cancelled() => {
                debug!(connection_id, "Listener closed during handshake");
                return;
            }
        };

        let handle = running.handle();
        tokio::pin!(running);

        let negotiated = tokio::select! {
            biased;
            session = negotiated_rx => session.ok(),
            result = &mut running => {
                let reason = match result {
                    Ok(()) => "connection closed".to_string(),
                    Err(e) => e.to_string(),
                };
                let err = if authenticated.load(Ordering::Acquire) {
                    Error::Negotiation(format!("{reason} before a session channel was opened"))
                } else {
                    Error::Handshake(reason)
                };
                self.fail(err);
                return;
            }
            () = &mut expired => {
                self.fail(self.timed_out(&authenticated, timeout));
                None
            }
            () = self.shutdown.cancelled() => {
                debug!(connection_id, "Listener closed during negotiation");
                None
            }
        };

        let Some(session) = negotiated else {
            closed.cancel();
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "no terminal session".to_string(),
                    String::new(),
                )
                .await;
            return;
        };

        info!(
            connection_id,
            peer_addr = %self.peer_addr,
            user = %session.user(),
            "Terminal session negotiated"
        );
        let emitted = tokio::select! {
            sent = sessions.send(session) => sent.is_ok(),
            () = self.shutdown.cancelled() => false,
        };
        // The stream ends once every sender is gone, so do not hold it while
        // the session runs.
        drop(sessions);
        if !emitted {
            debug!(connection_id, "Session stream gone before the session was taken");
            closed.cancel();
        }

        match running.await {
            Ok(()) => debug!(connection_id, "Connection closed cleanly"),
            Err(e) => debug!(connection_id, error = %e, "Connection ended with error"),
        }
        closed.cancel();
    }

    fn timed_out(&self, authenticated: &AtomicBool, timeout: Option<Duration>) -> Error {
        let reason = format!("no session channel within {timeout:?}");
        if authenticated.load(Ordering::Acquire) {
            Error::Negotiation(reason)
        } else {
            Error::Handshake(reason)
        }
    }

    fn fail(&self, err: Error) {
        match err {
            Error::Handshake(_) => info!(
                connection_id = self.connection_id,
                peer_addr = %self.peer_addr,
                error = %err,
                "Handshake failed"
            ),
            _ => info!(
                connection_id = self.connection_id,
                peer_addr = %self.peer_addr,
                error = %err,
                "Negotiation failed"
            ),
        }
    }
}
