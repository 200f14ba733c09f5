//! russh Handler implementation for terminal sessions.
//!
//! This module bridges russh's per-connection callbacks to the
//! [`AuthPolicy`](crate::AuthPolicy) and to the session machinery: it
//! decides authentication, negotiates the session channel, and forwards
//! input and channel requests to the [`TerminalSession`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::server::{Auth, Handler as RusshHandler, Msg, Session as RusshSession};
use russh::{Channel, ChannelId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::session::{
    ChannelRequest, SessionInfo, SessionParts, SessionState, TerminalSession, pump_output,
    serve_requests,
};
use crate::wire::{self, PtyRequest, WindowChange};
use crate::{AuthPolicy, Error, PublicKey, ServerOptions, Verdict, Window};

/// Input chunks buffered per session before new data is dropped.
const INPUT_BUFFER: usize = 1024;
/// Output chunks buffered per session before writers wait.
const OUTPUT_BUFFER: usize = 256;
/// Channel requests buffered per session.
const REQUEST_BUFFER: usize = 32;

/// Shared state for all connections to a listener.
pub(crate) struct ServerState {
    /// Listener options.
    pub(crate) options: ServerOptions,
    /// Authentication policy.
    pub(crate) policy: Arc<dyn AuthPolicy>,
    /// Connection counter for generating IDs.
    connection_counter: AtomicU64,
}

impl ServerState {
    pub(crate) fn new(options: ServerOptions, policy: Arc<dyn AuthPolicy>) -> Self {
        Self {
            options,
            policy,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Returns the next connection ID.
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Wiring from the transport to the negotiated session.
struct SessionLink {
    channel: ChannelId,
    /// `None` after the client sent EOF.
    input: Option<mpsc::Sender<Bytes>>,
    requests: mpsc::Sender<ChannelRequest>,
}

/// Handler for a single SSH connection.
///
/// Implements `russh::server::Handler`. The first session channel becomes
/// the connection's [`TerminalSession`], which is handed to the connection
/// task through a oneshot.
pub(crate) struct ConnectionHandler {
    /// Connection ID for logging.
    connection_id: u64,
    /// Remote address.
    remote_addr: SocketAddr,
    /// Listener-level shared state.
    server_state: Arc<ServerState>,
    /// User after authentication.
    user: Option<String>,
    /// Public key if auth'd via key.
    public_key: Option<PublicKey>,
    /// Set once authentication succeeds, read by the connection task.
    authenticated: Arc<AtomicBool>,
    /// Delivers the session; taken by the first session channel.
    negotiated: Option<oneshot::Sender<TerminalSession>>,
    /// Token the session closes with; shared with the connection task.
    closed: CancellationToken,
    link: Option<SessionLink>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        connection_id: u64,
        remote_addr: SocketAddr,
        server_state: Arc<ServerState>,
        authenticated: Arc<AtomicBool>,
        negotiated: oneshot::Sender<TerminalSession>,
        closed: CancellationToken,
    ) -> Self {
        debug!(
            connection_id,
            remote_addr = %remote_addr,
            "New connection handler created"
        );

        Self {
            connection_id,
            remote_addr,
            server_state,
            user: None,
            public_key: None,
            authenticated,
            negotiated: Some(negotiated),
            closed,
            link: None,
        }
    }

    fn accept(&mut self, user: &str, key: Option<PublicKey>) -> Auth {
        self.user = Some(user.to_string());
        self.public_key = key;
        self.authenticated.store(true, Ordering::Release);
        Auth::Accept
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Anonymous path shared by `none` and keyboard-interactive.
    async fn auth_anonymous(&mut self, user: &str, method: &'static str) -> Auth {
        let policy = self.server_state.policy.clone();
        if !policy.allow_anonymous() {
            debug!(
                connection_id = self.connection_id,
                user = user,
                method,
                "Anonymous access disabled"
            );
            return Self::reject();
        }

        match policy.is_allowed(self.remote_addr, None).await {
            Verdict::Allow => {
                info!(
                    connection_id = self.connection_id,
                    user = user,
                    method,
                    "Anonymous auth accepted"
                );
                self.accept(user, None)
            }
            Verdict::Deny { reason } => {
                info!(
                    connection_id = self.connection_id,
                    user = user,
                    method,
                    reason = %reason,
                    "Anonymous auth rejected"
                );
                Self::reject()
            }
        }
    }

    /// Hands a request to the session's request task and waits until it has
    /// been processed.
    ///
    /// russh has already decoded the payload by the time a callback runs;
    /// a truncated `pty-req` or `window-change` ends the connection inside
    /// the transport and never gets here. Payloads are re-encoded only so
    /// the request task sees every [`ChannelRequest`] in one form.
    async fn dispatch(
        &mut self,
        channel: ChannelId,
        kind: &str,
        want_reply: bool,
        payload: Bytes,
        session: &mut RusshSession,
    ) {
        let ok = match self.link.as_ref().filter(|link| link.channel == channel) {
            Some(link) => {
                let (request, outcome) = ChannelRequest::new(kind, want_reply, payload);
                if link.requests.send(request).await.is_ok() {
                    outcome.await.unwrap_or(false)
                } else {
                    false
                }
            }
            None => {
                debug!(
                    connection_id = self.connection_id,
                    channel = ?channel,
                    kind,
                    "Request for unknown channel"
                );
                false
            }
        };

        // russh only sends the reply when the client asked for one.
        if ok {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
    }

    fn log_refused_channel(&self, kind: &str) {
        info!(
            connection_id = self.connection_id,
            kind,
            "Refused channel: unknown channel type"
        );
    }
}

/// Encodes length-prefixed strings, for request types russh has already
/// decoded.
fn encode_strings(values: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    buf.freeze()
}

fn x11_payload(single_connection: bool, protocol: &str, cookie: &str, screen: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(u8::from(single_connection));
    buf.put_slice(&encode_strings(&[protocol.as_bytes(), cookie.as_bytes()]));
    buf.put_u32(screen);
    buf.freeze()
}

/// Re-encodes a `pty-req` russh has decoded into its wire payload.
fn pty_payload(term: &str, window: Window, modes: &[(russh::Pty, u32)]) -> Bytes {
    let modes: Vec<(u8, u32)> = modes.iter().map(|&(op, value)| (op as u8, value)).collect();
    PtyRequest {
        term: term.to_string(),
        window,
        modes: wire::encode_modes(&modes),
    }
    .encode()
}

#[async_trait]
impl RusshHandler for ConnectionHandler {
    type Error = Error;

    /// Handle public key authentication.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let key = PublicKey::from_russh(public_key.clone());
        debug!(
            connection_id = self.connection_id,
            user = user,
            key_type = key.algorithm(),
            "Public key auth attempt"
        );

        let policy = self.server_state.policy.clone();
        match policy.is_allowed(self.remote_addr, Some(&key)).await {
            Verdict::Allow => {
                info!(
                    connection_id = self.connection_id,
                    user = user,
                    fingerprint = %key.fingerprint(),
                    "Public key auth accepted"
                );
                Ok(self.accept(user, Some(key)))
            }
            Verdict::Deny { reason } => {
                info!(
                    connection_id = self.connection_id,
                    user = user,
                    fingerprint = %key.fingerprint(),
                    reason = %reason,
                    "Public key auth rejected"
                );
                Ok(Self::reject())
            }
        }
    }

    /// Handle "none" authentication.
    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        Ok(self.auth_anonymous(user, "none").await)
    }

    /// Handle keyboard-interactive authentication.
    ///
    /// Anonymous clients are accepted without presenting any prompt.
    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'async_trait>>,
    ) -> std::result::Result<Auth, Self::Error> {
        Ok(self.auth_anonymous(user, "keyboard-interactive").await)
    }

    /// Handle new session channel.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        let channel_id = channel.id();
        // Writes go through the session handle.
        drop(channel);

        let Some(negotiated) = self.negotiated.take() else {
            info!(
                connection_id = self.connection_id,
                channel = ?channel_id,
                "Refused additional session channel"
            );
            return Ok(false);
        };

        debug!(
            connection_id = self.connection_id,
            channel = ?channel_id,
            "Session channel opened"
        );

        let state = Arc::new(SessionState::new(
            self.server_state.options.prompt.clone(),
        ));
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_BUFFER);

        let terminal = TerminalSession::new(SessionParts {
            info: SessionInfo {
                id: self.connection_id,
                user: self.user.clone().unwrap_or_default(),
                remote_addr: self.remote_addr,
                public_key: self.public_key.clone(),
            },
            state: state.clone(),
            input: input_rx,
            output: output_tx,
            closed: self.closed.clone(),
        });

        tokio::spawn(pump_output(
            session.handle(),
            channel_id,
            output_rx,
            self.closed.clone(),
            self.connection_id,
        ));
        tokio::spawn(serve_requests(state, requests_rx, self.connection_id));

        self.link = Some(SessionLink {
            channel: channel_id,
            input: Some(input_tx),
            requests: requests_tx,
        });

        if negotiated.send(terminal).is_err() {
            // The connection task gave up waiting.
            return Ok(false);
        }
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            connection_id = self.connection_id,
            host = host_to_connect,
            port = port_to_connect,
            "direct-tcpip requested"
        );
        self.log_refused_channel("direct-tcpip");
        Ok(false)
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        self.log_refused_channel("forwarded-tcpip");
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        self.log_refused_channel("x11");
        Ok(false)
    }

    /// Handle PTY request.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(russh::Pty, u32)],
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            term = term,
            width = col_width,
            height = row_height,
            "PTY request"
        );

        let window = Window::new(col_width, row_height).with_pixels(pix_width, pix_height);
        let payload = pty_payload(term, window, modes);

        self.dispatch(channel, wire::PTY_REQ, true, payload, session)
            .await;
        Ok(())
    }

    /// Handle shell request.
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Shell request"
        );
        self.dispatch(channel, wire::SHELL, true, Bytes::new(), session)
            .await;
        Ok(())
    }

    /// Handle window change request.
    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            width = col_width,
            height = row_height,
            "Window change request"
        );

        let payload = WindowChange {
            window: Window::new(col_width, row_height).with_pixels(pix_width, pix_height),
        }
        .encode();
        self.dispatch(channel, wire::WINDOW_CHANGE, false, payload, session)
            .await;
        Ok(())
    }

    /// Handle exec request.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            command = %String::from_utf8_lossy(data),
            "Exec request"
        );
        self.dispatch(channel, "exec", true, encode_strings(&[data]), session)
            .await;
        Ok(())
    }

    /// Handle environment variable request.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = encode_strings(&[variable_name.as_bytes(), variable_value.as_bytes()]);
        self.dispatch(channel, "env", true, payload, session).await;
        Ok(())
    }

    /// Handle subsystem request.
    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = encode_strings(&[name.as_bytes()]);
        self.dispatch(channel, "subsystem", true, payload, session)
            .await;
        Ok(())
    }

    /// Handle X11 forwarding request.
    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = x11_payload(
            single_connection,
            x11_auth_protocol,
            x11_auth_cookie,
            x11_screen_number,
        );
        self.dispatch(channel, "x11-req", true, payload, session)
            .await;
        Ok(())
    }

    /// Handle signal delivery.
    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: russh::Sig,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let name = format!("{signal:?}");
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            signal = %name,
            "Signal request"
        );
        let payload = encode_strings(&[name.as_bytes()]);
        self.dispatch(channel, "signal", false, payload, session)
            .await;
        Ok(())
    }

    /// Handle data from client.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            len = data.len(),
            "Data received"
        );

        let input = self
            .link
            .as_ref()
            .filter(|link| link.channel == channel)
            .and_then(|link| link.input.as_ref());
        if let Some(input) = input {
            // try_send keeps a stalled reader from blocking the connection.
            if let Err(mpsc::error::TrySendError::Full(_)) =
                input.try_send(Bytes::copy_from_slice(data))
            {
                warn!(
                    connection_id = self.connection_id,
                    channel = ?channel,
                    "Input buffer full, dropping data (app not reading input?)"
                );
            }
        }
        Ok(())
    }

    /// Handle channel EOF.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Channel EOF"
        );
        // Dropping the input sender ends read_line once buffered input is
        // consumed; requests may still arrive.
        if let Some(link) = self.link.as_mut().filter(|link| link.channel == channel) {
            link.input = None;
        }
        Ok(())
    }

    /// Handle channel close.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Channel closed"
        );
        if self.link.as_ref().is_some_and(|link| link.channel == channel) {
            self.link = None;
            self.closed.cancel();
        }
        Ok(())
    }
}
