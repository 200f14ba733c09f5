//! Terminal sessions.
//!
//! A [`TerminalSession`] is one client's interactive terminal: it reads
//! edited lines, writes output, and tracks the dimensions negotiated by
//! `pty-req` and `window-change`.

mod editor;
mod request;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use russh::ChannelId;
use russh::server::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, PublicKey, Pty, Result, Window};

pub use editor::{LineEditor, LineEvent, MAX_HISTORY, MAX_LINE_LENGTH, Step};
pub use request::ChannelRequest;
pub(crate) use request::serve_requests;
#[cfg(test)]
pub(crate) use request::handle_request;

// -----------------------------------------------------------------------------
// Interactive State
// -----------------------------------------------------------------------------

/// Mutable terminal state shared by the application side and the request
/// task.
#[derive(Debug)]
pub(crate) struct SessionState {
    interactive: Mutex<Interactive>,
    shell_started: AtomicBool,
}

#[derive(Debug)]
struct Interactive {
    prompt: String,
    editor: LineEditor,
    pty: Option<Pty>,
    window: Option<Window>,
    /// A prompt is on screen and `read_line` is waiting for input.
    reading: bool,
    /// The last byte written to the client was `\r`.
    after_cr: bool,
}

impl SessionState {
    pub(crate) fn new(prompt: impl Into<String>) -> Self {
        Self {
            interactive: Mutex::new(Interactive {
                prompt: prompt.into(),
                editor: LineEditor::new(),
                pty: None,
                window: None,
                reading: false,
                after_cr: false,
            }),
            shell_started: AtomicBool::new(false),
        }
    }

    pub(crate) fn start_shell(&self) -> Result<()> {
        if self.shell_started.swap(true, Ordering::AcqRel) {
            return Err(Error::ShellAlreadyStarted);
        }
        Ok(())
    }

    pub(crate) fn shell_started(&self) -> bool {
        self.shell_started.load(Ordering::Acquire)
    }

    pub(crate) fn set_pty(&self, pty: Pty) -> Result<()> {
        validate(pty.window)?;
        let mut state = self.interactive.lock();
        state.window = Some(pty.window);
        state.pty = Some(pty);
        Ok(())
    }

    pub(crate) fn set_window(&self, window: Window) -> Result<()> {
        validate(window)?;
        let mut state = self.interactive.lock();
        state.window = Some(window);
        if let Some(pty) = state.pty.as_mut() {
            pty.window = window;
        }
        Ok(())
    }

    pub(crate) fn window(&self) -> Option<Window> {
        self.interactive.lock().window
    }

    pub(crate) fn pty(&self) -> Option<Pty> {
        self.interactive.lock().pty.clone()
    }
}

fn validate(window: Window) -> Result<()> {
    if window.width == 0 || window.height == 0 {
        return Err(Error::InvalidWindow {
            width: window.width,
            height: window.height,
        });
    }
    Ok(())
}

/// Clears the `reading` flag however `read_line` exits.
struct ReadingGuard<'a>(&'a SessionState);

impl Drop for ReadingGuard<'_> {
    fn drop(&mut self) {
        self.0.interactive.lock().reading = false;
    }
}

// -----------------------------------------------------------------------------
// Terminal Session
// -----------------------------------------------------------------------------

/// Identity of the client behind a session.
#[derive(Debug, Clone)]
pub(crate) struct SessionInfo {
    pub(crate) id: u64,
    pub(crate) user: String,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) public_key: Option<PublicKey>,
}

/// Channels and state a session is assembled from.
pub(crate) struct SessionParts {
    pub(crate) info: SessionInfo,
    pub(crate) state: Arc<SessionState>,
    pub(crate) input: mpsc::Receiver<Bytes>,
    pub(crate) output: mpsc::Sender<Bytes>,
    pub(crate) closed: CancellationToken,
}

struct Shared {
    info: SessionInfo,
    state: Arc<SessionState>,
    input: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    output: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// One client's interactive terminal.
///
/// Cloning is cheap; all clones refer to the same session. The session
/// closes when its connection ends or when [`close`](Self::close) is called.
#[derive(Clone)]
pub struct TerminalSession {
    shared: Arc<Shared>,
}

impl TerminalSession {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            shared: Arc::new(Shared {
                info: parts.info,
                state: parts.state,
                input: tokio::sync::Mutex::new(parts.input),
                output: parts.output,
                closed: parts.closed,
            }),
        }
    }

    /// Returns the connection id used in logs.
    pub fn id(&self) -> u64 {
        self.shared.info.id
    }

    /// Returns the authenticated user name.
    pub fn user(&self) -> &str {
        &self.shared.info.user
    }

    /// Returns the client's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.info.remote_addr
    }

    /// Returns the public key the client authenticated with, if any.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.shared.info.public_key.as_ref()
    }

    /// Returns the current dimensions, if a `pty-req` or `window-change`
    /// has set them.
    pub fn window(&self) -> Option<Window> {
        self.shared.state.window()
    }

    /// Returns the pseudo-terminal, if one was requested.
    pub fn pty(&self) -> Option<Pty> {
        self.shared.state.pty()
    }

    /// Returns true once a `shell` request has succeeded.
    pub fn shell_started(&self) -> bool {
        self.shared.state.shell_started()
    }

    /// Returns the prompt shown by [`read_line`](Self::read_line).
    pub fn prompt(&self) -> String {
        self.shared.state.interactive.lock().prompt.clone()
    }

    /// Sets the prompt shown by [`read_line`](Self::read_line).
    pub fn set_prompt(&self, prompt: impl Into<String>) {
        self.shared.state.interactive.lock().prompt = prompt.into();
    }

    /// Sets the terminal dimensions.
    ///
    /// Zero width or height is rejected with [`Error::InvalidWindow`].
    pub fn set_size(&self, width: u32, height: u32) -> Result<()> {
        let window = match self.window() {
            Some(current) => Window { width, height, ..current },
            None => Window::new(width, height),
        };
        self.shared.state.set_window(window)
    }

    /// Reads one edited line.
    ///
    /// Shows the prompt, echoes input, and returns `Ok(None)` once the
    /// session has ended or the client sent Ctrl-D on an empty line.
    /// Concurrent calls are served one after the other.
    pub async fn read_line(&self) -> Result<Option<String>> {
        let mut input = self.shared.input.lock().await;
        if self.is_closed() {
            return Ok(None);
        }

        let state: &SessionState = &self.shared.state;
        let _reading = ReadingGuard(state);
        let prompt = {
            let mut interactive = state.interactive.lock();
            interactive.reading = true;
            interactive.after_cr = false;
            interactive.editor.redraw(&interactive.prompt)
        };
        if self.send(prompt).await.is_err() {
            return Ok(None);
        }

        loop {
            loop {
                let step = {
                    let mut interactive = state.interactive.lock();
                    let mut step = interactive.editor.step();
                    if let Some(step) = step.as_mut()
                        && step.event == Some(LineEvent::Interrupt)
                    {
                        step.echo.extend_from_slice(interactive.prompt.as_bytes());
                    }
                    step
                };
                let Some(step) = step else { break };

                if !step.echo.is_empty() && self.send(step.echo).await.is_err() {
                    return Ok(None);
                }
                match step.event {
                    Some(LineEvent::Line(line)) => {
                        trace!(connection_id = self.id(), len = line.len(), "Line read");
                        return Ok(Some(line));
                    }
                    Some(LineEvent::Eof) => return Ok(None),
                    Some(LineEvent::Interrupt) | None => {}
                }
            }

            tokio::select! {
                biased;
                data = input.recv() => match data {
                    Some(data) => state.interactive.lock().editor.push_input(&data),
                    None => return Ok(None),
                },
                () = self.shared.closed.cancelled() => return Ok(None),
            }
        }
    }

    /// Writes raw bytes to the terminal.
    ///
    /// Bare `\n` is sent as `\r\n`. If a line is being edited, it is erased
    /// first and redrawn after the output.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedSession);
        }
        let out = {
            let mut interactive = self.shared.state.interactive.lock();
            let translated = translate_newlines(data, interactive.after_cr);
            if let Some(&last) = data.last() {
                interactive.after_cr = last == b'\r';
            }
            if interactive.reading {
                interactive.after_cr = false;
                let mut out = Vec::with_capacity(translated.len() + 16);
                out.extend_from_slice(LineEditor::erase());
                out.extend_from_slice(&translated);
                out.extend(interactive.editor.redraw(&interactive.prompt));
                out
            } else {
                translated
            }
        };
        self.send(out).await
    }

    /// Writes a string to the terminal.
    pub async fn write_str(&self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await
    }

    /// Writes a string followed by a line break.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let mut line = String::with_capacity(text.len() + 2);
        line.push_str(text);
        line.push_str("\r\n");
        self.write(line.as_bytes()).await
    }

    /// Ends the session and disconnects its connection.
    ///
    /// Calling `close` again has no effect.
    pub fn close(&self) -> Result<()> {
        if !self.shared.closed.is_cancelled() {
            debug!(connection_id = self.id(), "Closing session");
            self.shared.closed.cancel();
        }
        Ok(())
    }

    /// Returns true once the session has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves when the session ends.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = self.shared.closed.cancelled() => Err(Error::ClosedSession),
            sent = self.shared.output.send(Bytes::from(data)) => {
                sent.map_err(|_| Error::ClosedSession)
            }
        }
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id())
            .field("user", &self.user())
            .field("remote_addr", &self.remote_addr())
            .field("window", &self.window())
            .field("shell_started", &self.shell_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Converts bare `\n` to `\r\n`, leaving existing `\r\n` alone.
///
/// `after_cr` says whether the previous write ended with `\r`, so a pair
/// split across writes is not doubled.
fn translate_newlines(data: &[u8], after_cr: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut prev_cr = after_cr;
    for &byte in data {
        if byte == b'\n' && !prev_cr {
            out.push(b'\r');
        }
        out.push(byte);
        prev_cr = byte == b'\r';
    }
    out
}

// -----------------------------------------------------------------------------
// Output Pump
// -----------------------------------------------------------------------------

/// Forwards session output to the channel until the session closes, then
/// disconnects the connection.
///
/// Output queued before the close is flushed first.
pub(crate) async fn pump_output(
    handle: Handle,
    channel: ChannelId,
    mut output: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    connection_id: u64,
) {
    debug!(connection_id, channel = ?channel, "Starting output pump");
    loop {
        tokio::select! {
            biased;
            data = output.recv() => {
                let Some(data) = data else { break };
                if handle
                    .data(channel, russh::CryptoVec::from_slice(&data))
                    .await
                    .is_err()
                {
                    debug!(connection_id, channel = ?channel, "Channel gone, stopping output");
                    closed.cancel();
                    break;
                }
            }
            () = closed.cancelled() => {
                let _ = handle
                    .disconnect(
                        russh::Disconnect::ByApplication,
                        "session closed".to_string(),
                        String::new(),
                    )
                    .await;
                break;
            }
        }
    }
    debug!(connection_id, channel = ?channel, "Output pump finished");
}
