//! Session-level channel request processing.
//!
//! Every session owns one request task that consumes [`ChannelRequest`]s in
//! the order the transport delivered them and applies them to the session's
//! interactive state.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::SessionState;
use crate::wire::{self, PtyRequest, WindowChange};
use crate::{Error, Pty, Result};

/// A channel request addressed to a session.
#[derive(Debug)]
pub struct ChannelRequest {
    /// Request type, e.g. `pty-req`.
    pub kind: String,
    /// Whether the client expects a success or failure reply.
    pub want_reply: bool,
    /// Type-specific payload in wire encoding.
    pub payload: Bytes,
    outcome: Option<oneshot::Sender<bool>>,
}

impl ChannelRequest {
    /// Creates a request and the receiver that learns whether it succeeded.
    ///
    /// The receiver resolves once the request has been processed, whether
    /// or not a reply is wanted; it errors if the request is dropped
    /// unprocessed.
    pub fn new(
        kind: impl Into<String>,
        want_reply: bool,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            want_reply,
            payload,
            outcome: Some(tx),
        };
        (request, rx)
    }

    /// Reports the outcome to whoever submitted the request.
    fn complete(mut self, ok: bool) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(ok);
        }
    }
}

/// Applies one request to the session state.
pub(crate) fn handle_request(state: &SessionState, kind: &str, payload: &[u8]) -> Result<()> {
    match kind {
        wire::SHELL => state.start_shell(),
        wire::PTY_REQ => {
            let req = PtyRequest::parse(payload)?;
            state.set_pty(Pty {
                term: req.term,
                window: req.window,
                modes: req.modes,
            })
        }
        wire::WINDOW_CHANGE => {
            let change = WindowChange::parse(payload)?;
            state.set_window(change.window)
        }
        other => Err(Error::UnsupportedRequest(other.to_string())),
    }
}

/// Processes requests until the sender side goes away.
///
/// The session itself is left open; its lifetime follows the connection.
pub(crate) async fn serve_requests(
    state: Arc<SessionState>,
    mut requests: mpsc::Receiver<ChannelRequest>,
    connection_id: u64,
) {
    while let Some(request) = requests.recv().await {
        let result = handle_request(&state, &request.kind, &request.payload);
        match &result {
            Ok(()) => debug!(
                connection_id,
                kind = %request.kind,
                want_reply = request.want_reply,
                "Request applied"
            ),
            Err(Error::UnsupportedRequest(_)) => debug!(
                connection_id,
                kind = %request.kind,
                "Unsupported request refused"
            ),
            Err(e) => info!(
                connection_id,
                kind = %request.kind,
                error = %e,
                "Request failed"
            ),
        }
        request.complete(result.is_ok());
    }
    debug!(connection_id, "Request stream ended");
}
