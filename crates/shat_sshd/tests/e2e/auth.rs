//! Authentication tests: key and anonymous logins against access policies.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use shat_sshd::{AccessList, AuthPolicy, PublicKey, Verdict};

use super::common::{
    ALICE_KEY, ALICE_PUB, BOB_KEY, BOB_PUB, TestClient, TestServer, key_pair, public_key,
    start_shell, wait_reply,
};

fn operators_only() -> Arc<AccessList> {
    Arc::new(
        AccessList::new()
            .restricted(true)
            .with_operators([public_key(ALICE_PUB)]),
    )
}

#[tokio::test]
async fn test_restricted_rejects_unknown_key() {
    let server = TestServer::start(operators_only()).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(!client.auth_key("bob", key_pair(BOB_KEY)).await);
}

#[tokio::test]
async fn test_restricted_rejects_anonymous() {
    let server = TestServer::start(operators_only()).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(!client.auth_none("guest").await);
}

#[tokio::test]
async fn test_restricted_accepts_operator_key() {
    let mut server = TestServer::start(operators_only()).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(client.auth_key("alice", key_pair(ALICE_KEY)).await);
    let _channel = client.open_session().await;

    let term = server.next_terminal().await;
    assert_eq!(term.user(), "alice");
    assert_eq!(term.public_key(), Some(&public_key(ALICE_PUB)));
}

#[tokio::test]
async fn test_banned_address_rejected_until_unbanned() {
    let policy = Arc::new(AccessList::new());
    let mut server = TestServer::start(policy.clone()).await;
    let ip = server.addr().ip();

    assert!(policy.ban(ip));
    let mut client = TestClient::connect(server.addr()).await;
    assert!(!client.auth_none("guest").await);
    assert!(!client.auth_key("alice", key_pair(ALICE_KEY)).await);
    client.disconnect().await;

    assert!(policy.unban(ip));
    let (_client, _channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    assert_eq!(term.user(), "guest");
}

#[tokio::test]
async fn test_key_sessions_are_isolated() {
    let mut server = TestServer::start(Arc::new(AccessList::new())).await;

    let mut alice = TestClient::connect(server.addr()).await;
    assert!(alice.auth_key("alice", key_pair(ALICE_KEY)).await);
    let mut alice_channel = alice.open_session().await;
    let alice_term = server.next_terminal().await;

    let mut bob = TestClient::connect(server.addr()).await;
    assert!(bob.auth_key("bob", key_pair(BOB_KEY)).await);
    let mut bob_channel = bob.open_session().await;
    let bob_term = server.next_terminal().await;

    start_shell(&mut alice_channel).await;
    start_shell(&mut bob_channel).await;

    alice_channel.window_change(120, 40, 0, 0).await.unwrap();
    // Requests are handled in order, so this reply follows the resize.
    alice_channel.request_shell(true).await.unwrap();
    assert!(!wait_reply(&mut alice_channel).await);

    let alice_window = alice_term.window().unwrap();
    assert_eq!((alice_window.width, alice_window.height), (120, 40));
    let bob_window = bob_term.window().unwrap();
    assert_eq!((bob_window.width, bob_window.height), (80, 24));
    assert_eq!(bob_term.public_key(), Some(&public_key(BOB_PUB)));
}

/// Counts policy consultations and denies everything without a key.
struct KeysOnly {
    checks: AtomicUsize,
}

#[async_trait]
impl AuthPolicy for KeysOnly {
    fn allow_anonymous(&self) -> bool {
        false
    }

    async fn is_allowed(&self, _remote_addr: SocketAddr, key: Option<&PublicKey>) -> Verdict {
        self.checks.fetch_add(1, Ordering::SeqCst);
        match key {
            Some(_) => Verdict::Allow,
            None => Verdict::deny("key required"),
        }
    }
}

#[tokio::test]
async fn test_custom_policy_is_consulted() {
    let policy = Arc::new(KeysOnly {
        checks: AtomicUsize::new(0),
    });
    let mut server = TestServer::start(policy.clone()).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(!client.auth_none("guest").await);
    assert!(client.auth_key("bob", key_pair(BOB_KEY)).await);
    let _channel = client.open_session().await;

    let term = server.next_terminal().await;
    assert_eq!(term.user(), "bob");
    assert!(policy.checks.load(Ordering::SeqCst) >= 1);
}
