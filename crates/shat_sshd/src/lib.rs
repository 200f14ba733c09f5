#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # shat_sshd
//!
//! Accepts SSH connections, authenticates them through a pluggable
//! [`AuthPolicy`], and hands every accepted connection to the application as
//! an interactive, line-oriented [`TerminalSession`].
//!
//! ## Features
//!
//! - **Pluggable authentication**: anonymous and public key access decided
//!   by an [`AuthPolicy`] per remote address
//! - **Session stream**: negotiated sessions arrive on a [`Terminals`] stream
//!   with backpressure from the consumer down to `accept`
//! - **Request tracking**: `shell`, `pty-req` and `window-change` handled per
//!   session, in order
//! - **Line editing**: echo, cursor movement and history for `read_line`
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shat_sshd::{Listener, OpenPolicy, ServerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), shat_sshd::Error> {
//!     let options = ServerBuilder::new().address("0.0.0.0:1337").build()?;
//!     let listener = Listener::bind(options, Arc::new(OpenPolicy::new())).await?;
//!
//!     let mut terminals = listener.serve_terminals()?;
//!     while let Some(term) = terminals.next().await {
//!         tokio::spawn(async move {
//!             while let Ok(Some(line)) = term.read_line().await {
//!                 let _ = term.write_line(&format!("server: {line}")).await;
//!             }
//!         });
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use russh_keys::PublicKeyBase64;
use thiserror::Error;

pub mod auth;
mod handler;
mod listener;
pub mod session;
pub mod wire;

pub use auth::{
    AccessList, AuthPolicy, AuthorizedKey, OpenPolicy, Verdict, expand_tilde,
    load_authorized_keys, parse_authorized_keys,
};
pub use listener::{Listener, Terminals};
pub use session::{ChannelRequest, LineEditor, LineEvent, TerminalSession};

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur while serving terminal sessions.
///
/// Per-connection and per-request errors never escape their own scope: a
/// failed handshake or a malformed request affects only that connection or
/// that request. Only [`Bind`](Error::Bind) and configuration errors are
/// fatal at startup.
///
/// | Error Variant | Scope |
/// |--------------|-------|
/// | [`Bind`](Error::Bind) | Listener startup, fatal |
/// | [`Handshake`](Error::Handshake) | One connection, logged and dropped |
/// | [`Negotiation`](Error::Negotiation) | One connection, logged and dropped |
/// | [`MalformedRequest`](Error::MalformedRequest) | One request, failure reply |
/// | [`InvalidWindow`](Error::InvalidWindow) | One request, failure reply |
/// | [`ShellAlreadyStarted`](Error::ShellAlreadyStarted) | One request, failure reply |
/// | [`UnsupportedRequest`](Error::UnsupportedRequest) | One request, failure reply |
/// | [`ClosedSession`](Error::ClosedSession) | Returned to the caller |
#[derive(Error, Debug)]
pub enum Error {
    /// The listening socket could not be bound.
    ///
    /// Commonly occurs when the address is already in use or the port is
    /// privileged.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The transport handshake or authentication failed for a connection.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An authenticated connection never offered a usable session channel.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A channel request carried a payload that does not decode.
    #[error("malformed {kind} request: {reason}")]
    MalformedRequest {
        /// Request type, e.g. `pty-req`.
        kind: &'static str,
        /// What was wrong with the payload.
        reason: String,
    },

    /// Terminal dimensions were rejected by the interactive state.
    #[error("invalid window size {width}x{height}")]
    InvalidWindow {
        /// Requested width in columns.
        width: u32,
        /// Requested height in rows.
        height: u32,
    },

    /// A second `shell` request arrived on a session.
    #[error("shell already started")]
    ShellAlreadyStarted,

    /// A channel request of a type terminal sessions do not serve.
    #[error("unsupported request: {0}")]
    UnsupportedRequest(String),

    /// The session has ended.
    #[error("session is closed")]
    ClosedSession,

    /// `serve_terminals` was called more than once.
    #[error("listener is already serving terminals")]
    AlreadyServing,

    /// The listener has been closed.
    #[error("listener is closed")]
    ListenerClosed,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Underlying russh library error.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Key decoding error.
    #[error("key error: {0}")]
    Key(String),

    /// Key loading error from russh-keys.
    #[error("key loading error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// Server configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

/// A specialized [`Result`] type for shat_sshd operations.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------
// PTY Types
// -----------------------------------------------------------------------------

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
    /// Terminal width in pixels, 0 when unknown.
    pub pixel_width: u32,
    /// Terminal height in pixels, 0 when unknown.
    pub pixel_height: u32,
}

impl Window {
    /// Creates a window of `width` columns by `height` rows.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Sets the pixel dimensions.
    pub fn with_pixels(mut self, pixel_width: u32, pixel_height: u32) -> Self {
        self.pixel_width = pixel_width;
        self.pixel_height = pixel_height;
        self
    }
}

/// Pseudo-terminal allocated by a `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    /// Terminal type (e.g., "xterm-256color").
    pub term: String,
    /// Window dimensions.
    pub window: Window,
    /// Encoded terminal modes as sent by the client.
    pub modes: bytes::Bytes,
}

// -----------------------------------------------------------------------------
// Public Key Types
// -----------------------------------------------------------------------------

/// A client public key offered during authentication.
#[derive(Clone)]
pub struct PublicKey {
    key: russh_keys::key::PublicKey,
}

impl PublicKey {
    /// Wraps a key decoded by the transport.
    pub fn from_russh(key: russh_keys::key::PublicKey) -> Self {
        Self { key }
    }

    /// Parses the base64 blob of an OpenSSH public key line.
    pub fn parse_openssh(base64: &str) -> Result<Self> {
        let key = russh_keys::parse_public_key_base64(base64)?;
        Ok(Self { key })
    }

    /// Returns the key type (e.g., "ssh-ed25519", "ssh-rsa").
    pub fn algorithm(&self) -> &'static str {
        match self.key.name() {
            "rsa-sha2-256" | "rsa-sha2-512" => "ssh-rsa",
            other => other,
        }
    }

    /// Returns the key in SSH wire encoding.
    pub fn blob(&self) -> Vec<u8> {
        self.key.public_key_bytes()
    }

    /// Returns the key as it appears in an `authorized_keys` line.
    pub fn to_openssh(&self) -> String {
        format!("{} {}", self.algorithm(), self.key.public_key_base64())
    }

    /// Returns the SHA-256 fingerprint, e.g. `SHA256:...`.
    pub fn fingerprint(&self) -> String {
        format!("SHA256:{}", self.key.fingerprint())
    }

    /// Returns the transport's key type.
    pub fn as_russh(&self) -> &russh_keys::key::PublicKey {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm() == other.algorithm() && self.blob() == other.blob()
    }
}

impl Eq for PublicKey {}

// -----------------------------------------------------------------------------
// Server Options
// -----------------------------------------------------------------------------

/// What the accept loop does when `accept` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptErrorPolicy {
    /// Stop accepting and close the session stream.
    #[default]
    Terminate,
    /// Log the error, wait `backoff`, and keep accepting.
    Retry {
        /// Delay before the next accept.
        backoff: Duration,
    },
}

/// Default listen address.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:1337";

/// Default maximum authentication attempts before disconnection.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Default authentication rejection delay to mitigate timing attacks.
pub const DEFAULT_AUTH_REJECTION_DELAY: Duration = Duration::from_millis(100);

/// Default time a connection gets to open its session channel.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of sessions that may wait for the consumer.
pub const DEFAULT_SESSION_BACKLOG: usize = 16;

/// Options for configuring the SSH listener.
#[derive(Clone)]
pub struct ServerOptions {
    /// Listen address.
    pub address: String,
    /// Server version string.
    pub version: String,
    /// Authentication banner.
    pub banner: Option<String>,
    /// Host key path.
    pub host_key_path: Option<PathBuf>,
    /// Host key PEM data.
    pub host_key_pem: Option<Vec<u8>>,
    /// Passphrase for an encrypted host key.
    pub host_key_passphrase: Option<String>,
    /// Idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Maximum authentication attempts before disconnection.
    pub max_auth_attempts: u32,
    /// Authentication rejection delay (timing attack mitigation).
    pub auth_rejection_delay: Duration,
    /// Time from accept until the session channel must be open.
    pub negotiation_timeout: Option<Duration>,
    /// Capacity of the session stream.
    pub session_backlog: usize,
    /// Behavior on accept errors.
    pub accept_error_policy: AcceptErrorPolicy,
    /// Initial prompt of every session.
    pub prompt: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            version: "SSH-2.0-shat".to_string(),
            banner: None,
            host_key_path: None,
            host_key_pem: None,
            host_key_passphrase: None,
            idle_timeout: None,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            auth_rejection_delay: DEFAULT_AUTH_REJECTION_DELAY,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            session_backlog: DEFAULT_SESSION_BACKLOG,
            accept_error_policy: AcceptErrorPolicy::default(),
            prompt: "> ".to_string(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("banner", &self.banner)
            .field("host_key_path", &self.host_key_path)
            .field("idle_timeout", &self.idle_timeout)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("session_backlog", &self.session_backlog)
            .field("accept_error_policy", &self.accept_error_policy)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Server Builder
// -----------------------------------------------------------------------------

/// Builder for [`ServerOptions`].
#[derive(Default)]
pub struct ServerBuilder {
    options: ServerOptions,
}

impl ServerBuilder {
    /// Creates a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.options.address = addr.into();
        self
    }

    /// Sets the server version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    /// Sets the authentication banner.
    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.options.banner = Some(banner.into());
        self
    }

    /// Sets the host key path.
    pub fn host_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.host_key_path = Some(path.into());
        self
    }

    /// Sets the host key from PEM data.
    pub fn host_key_pem(mut self, pem: Vec<u8>) -> Self {
        self.options.host_key_pem = Some(pem);
        self
    }

    /// Sets the passphrase used to decrypt the host key.
    pub fn host_key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.options.host_key_passphrase = Some(passphrase.into());
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, duration: Duration) -> Self {
        self.options.idle_timeout = Some(duration);
        self
    }

    /// Sets the maximum authentication attempts.
    pub fn max_auth_attempts(mut self, max: u32) -> Self {
        self.options.max_auth_attempts = max;
        self
    }

    /// Sets the authentication rejection delay.
    pub fn auth_rejection_delay(mut self, delay: Duration) -> Self {
        self.options.auth_rejection_delay = delay;
        self
    }

    /// Sets the negotiation timeout; `None` waits for as long as the
    /// connection lives.
    pub fn negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.negotiation_timeout = timeout;
        self
    }

    /// Sets how many sessions may wait for the consumer.
    pub fn session_backlog(mut self, backlog: usize) -> Self {
        self.options.session_backlog = backlog;
        self
    }

    /// Sets the accept error policy.
    pub fn accept_error_policy(mut self, policy: AcceptErrorPolicy) -> Self {
        self.options.accept_error_policy = policy;
        self
    }

    /// Sets the initial prompt of every session.
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.prompt = prompt.into();
        self
    }

    /// Validates and returns the options.
    pub fn build(self) -> Result<ServerOptions> {
        let options = self.options;
        if options.session_backlog == 0 {
            return Err(Error::Configuration(
                "session backlog must be at least 1".to_string(),
            ));
        }
        if options.max_auth_attempts == 0 {
            return Err(Error::Configuration(
                "max auth attempts must be at least 1".to_string(),
            ));
        }
        if options.host_key_path.is_some() && options.host_key_pem.is_some() {
            return Err(Error::Configuration(
                "host key path and host key PEM are mutually exclusive".to_string(),
            ));
        }
        Ok(options)
    }
}

pub mod prelude {
    //! Commonly used types.

    pub use crate::{
        AccessList, AuthPolicy, Error, Listener, OpenPolicy, Result, ServerBuilder,
        ServerOptions, TerminalSession, Terminals, Verdict, Window,
    };
}
