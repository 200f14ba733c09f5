//! Terminal request tests: pty-req, window-change, and refused requests.

use std::sync::Arc;
use std::time::Duration;

use shat_sshd::OpenPolicy;

use super::common::{DEFAULT_TIMEOUT, TestClient, TestServer, start_shell, wait_reply};

#[tokio::test]
async fn test_window_change_updates_size() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    start_shell(&mut channel).await;

    channel.window_change(100, 30, 800, 600).await.unwrap();
    channel.request_shell(true).await.unwrap();
    assert!(!wait_reply(&mut channel).await);

    let window = term.window().unwrap();
    assert_eq!((window.width, window.height), (100, 30));
    assert_eq!((window.pixel_width, window.pixel_height), (800, 600));
}

#[tokio::test]
async fn test_zero_window_change_is_ignored() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    start_shell(&mut channel).await;

    channel.window_change(0, 0, 0, 0).await.unwrap();
    channel.request_shell(true).await.unwrap();
    assert!(!wait_reply(&mut channel).await);

    let window = term.window().unwrap();
    assert_eq!((window.width, window.height), (80, 24));
    assert!(!term.is_closed());
}

#[tokio::test]
async fn test_zero_pty_size_is_refused() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    channel
        .request_pty(true, "xterm", 0, 24, 0, 0, &[])
        .await
        .unwrap();
    assert!(!wait_reply(&mut channel).await);
    assert!(term.pty().is_none());

    channel
        .request_pty(true, "vt100", 40, 10, 0, 0, &[])
        .await
        .unwrap();
    assert!(wait_reply(&mut channel).await);
    assert_eq!(term.pty().unwrap().term, "vt100");
}

#[tokio::test]
async fn test_shell_without_pty() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    channel.request_shell(true).await.unwrap();
    assert!(wait_reply(&mut channel).await);
    assert!(term.shell_started());
    assert!(term.pty().is_none());
    assert!(term.window().is_none());
}

#[tokio::test]
async fn test_exec_and_subsystem_are_refused() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    channel.exec(true, "uptime").await.unwrap();
    assert!(!wait_reply(&mut channel).await);
    channel.request_subsystem(true, "sftp").await.unwrap();
    assert!(!wait_reply(&mut channel).await);
    channel.set_env(true, "LANG", "C").await.unwrap();
    assert!(!wait_reply(&mut channel).await);

    assert!(!term.shell_started());
    start_shell(&mut channel).await;
}

#[tokio::test]
async fn test_x11_request_gets_failure_reply() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    channel
        .request_x11(true, false, "MIT-MAGIC-COOKIE-1", "0123456789abcdef", 0)
        .await
        .unwrap();
    assert!(!wait_reply(&mut channel).await);
    assert!(!term.is_closed());
}

#[tokio::test]
async fn test_signal_is_ignored() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    channel.signal(russh::Sig::INT).await.unwrap();
    start_shell(&mut channel).await;
    assert!(term.shell_started());
    assert!(!term.is_closed());
}

#[tokio::test]
async fn test_pty_modes_preserved() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    channel
        .request_pty(true, "xterm-256color", 80, 24, 0, 0, &[(russh::Pty::VINTR, 3)])
        .await
        .unwrap();
    assert!(wait_reply(&mut channel).await);

    let pty = term.pty().unwrap();
    assert_eq!(pty.term, "xterm-256color");
    assert_eq!(&pty.modes[..], &[1, 0, 0, 0, 3, 0]);
}

#[tokio::test]
async fn test_second_session_channel_refused() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    let second = tokio::time::timeout(DEFAULT_TIMEOUT, client.handle.channel_open_session())
        .await
        .expect("second channel open timed out");
    assert!(second.is_err());
    server.expect_no_terminal(Duration::from_millis(200)).await;

    start_shell(&mut channel).await;
    assert!(term.shell_started());
}
