//! Connection authentication policies.
//!
//! An [`AuthPolicy`] decides, per remote address, whether a client may
//! connect anonymously or with a given public key. The listener consults it
//! from the transport's authentication callbacks.
//!
//! # Example
//!
//! ```rust,ignore
//! use shat_sshd::auth::{AccessList, load_authorized_keys};
//!
//! let ops = load_authorized_keys("~/.ssh/operators")?;
//! let policy = AccessList::new().with_operators(ops.into_iter().map(|k| k.key));
//! policy.ban("203.0.113.7".parse()?);
//! ```

mod access_list;
mod authorized_keys;

pub use access_list::AccessList;
pub use authorized_keys::{AuthorizedKey, expand_tilde, load_authorized_keys, parse_authorized_keys};

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::PublicKey;

/// Outcome of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The client may proceed.
    Allow,
    /// The client is refused.
    Deny {
        /// Why, for the logs.
        reason: String,
    },
}

impl Verdict {
    /// Creates a denial with the given reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    /// Returns true if the verdict allows the client.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides who may open a terminal session.
///
/// One policy instance is shared by every connection attempt, so
/// implementations must tolerate concurrent calls and synchronize any
/// mutable state internally.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    /// Returns true if clients without a key may attempt to connect.
    fn allow_anonymous(&self) -> bool;

    /// Decides whether `remote_addr` may connect, anonymously when `key` is
    /// `None`.
    async fn is_allowed(&self, remote_addr: SocketAddr, key: Option<&PublicKey>) -> Verdict;
}

/// Allows everyone, with or without a key.
///
/// Useful for development and tests; not a safe production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl OpenPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthPolicy for OpenPolicy {
    fn allow_anonymous(&self) -> bool {
        true
    }

    async fn is_allowed(&self, _remote_addr: SocketAddr, _key: Option<&PublicKey>) -> Verdict {
        Verdict::Allow
    }
}
