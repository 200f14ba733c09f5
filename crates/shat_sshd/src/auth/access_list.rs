//! Ban list and operator keys.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{AuthPolicy, Verdict};
use crate::PublicKey;

/// A policy backed by a runtime-mutable ban list and a set of operator keys.
///
/// By default anonymous clients and any key are allowed unless the client's
/// IP address is banned. In restricted mode only operator keys get in.
#[derive(Debug)]
pub struct AccessList {
    banned: RwLock<HashSet<IpAddr>>,
    operators: RwLock<Vec<PublicKey>>,
    anonymous: bool,
    restricted: bool,
}

impl Default for AccessList {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessList {
    /// Creates an access list that allows everyone.
    pub fn new() -> Self {
        Self {
            banned: RwLock::new(HashSet::new()),
            operators: RwLock::new(Vec::new()),
            anonymous: true,
            restricted: false,
        }
    }

    /// Sets whether clients without a key may connect.
    pub fn with_anonymous(mut self, allow: bool) -> Self {
        self.anonymous = allow;
        self
    }

    /// Sets whether only operator keys may connect.
    pub fn restricted(mut self, restricted: bool) -> Self {
        self.restricted = restricted;
        self
    }

    /// Adds operator keys.
    pub fn with_operators(self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        for key in keys {
            self.add_operator(key);
        }
        self
    }

    /// Bans an address. Returns false if it was already banned.
    pub fn ban(&self, ip: IpAddr) -> bool {
        let added = self.banned.write().insert(ip);
        if added {
            info!(ip = %ip, "Address banned");
        }
        added
    }

    /// Lifts a ban. Returns false if the address was not banned.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let removed = self.banned.write().remove(&ip);
        if removed {
            info!(ip = %ip, "Address unbanned");
        }
        removed
    }

    /// Returns true if the address is banned.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.read().contains(&ip)
    }

    /// Adds an operator key. Returns false if it was already present.
    pub fn add_operator(&self, key: PublicKey) -> bool {
        let mut operators = self.operators.write();
        if operators.contains(&key) {
            return false;
        }
        debug!(fingerprint = %key.fingerprint(), "Operator key added");
        operators.push(key);
        true
    }

    /// Returns true if `key` is an operator key.
    pub fn is_operator(&self, key: &PublicKey) -> bool {
        self.operators.read().contains(key)
    }

    /// Returns the number of operator keys.
    pub fn operator_count(&self) -> usize {
        self.operators.read().len()
    }
}

#[async_trait]
impl AuthPolicy for AccessList {
    fn allow_anonymous(&self) -> bool {
        self.anonymous && !self.restricted
    }

    async fn is_allowed(&self, remote_addr: SocketAddr, key: Option<&PublicKey>) -> Verdict {
        if self.is_banned(remote_addr.ip()) {
            return Verdict::deny("address is banned");
        }
        match key {
            None if !self.allow_anonymous() => Verdict::deny("anonymous access is disabled"),
            None => Verdict::Allow,
            Some(key) if self.restricted && !self.is_operator(key) => {
                Verdict::deny("key is not an operator key")
            }
            Some(_) => Verdict::Allow,
        }
    }
}
