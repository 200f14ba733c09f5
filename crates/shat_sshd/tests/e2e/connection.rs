//! Connection lifecycle tests: accepting, negotiation, shutdown.

use std::sync::Arc;
use std::time::Duration;

use shat_sshd::{Error, Listener, OpenPolicy, ServerBuilder};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::common::{
    DEFAULT_TIMEOUT, TestClient, TestServer, read_until, start_shell, test_options, wait_closed,
    wait_reply,
};

#[tokio::test]
async fn test_anonymous_session_negotiates() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;

    assert_eq!(term.user(), "guest");
    assert!(term.public_key().is_none());
    assert_eq!(term.remote_addr().ip().to_string(), "127.0.0.1");

    start_shell(&mut channel).await;
    assert!(term.shell_started());
    let window = term.window().expect("window after pty-req");
    assert_eq!((window.width, window.height), (80, 24));
    assert_eq!(term.pty().expect("pty").term, "xterm");

    client.disconnect().await;
    let line = timeout(DEFAULT_TIMEOUT, term.read_line())
        .await
        .expect("read_line did not end");
    assert!(matches!(line, Ok(None)));
    timeout(DEFAULT_TIMEOUT, term.closed())
        .await
        .expect("session was not closed");
    assert!(term.is_closed());
}

#[tokio::test]
async fn test_second_shell_request_fails() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let _term = server.next_terminal().await;

    start_shell(&mut channel).await;
    channel.request_shell(true).await.unwrap();
    assert!(!wait_reply(&mut channel).await);
}

#[tokio::test]
async fn test_line_echo_round_trip() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    start_shell(&mut channel).await;

    let reader = tokio::spawn(async move {
        let line = term.read_line().await.unwrap();
        let reply = format!("server: {}", line.as_deref().unwrap_or_default());
        term.write_line(&reply).await.unwrap();
        (term, line)
    });

    read_until(&mut channel, "> ").await;
    channel.data(&b"hello\r"[..]).await.unwrap();
    let output = read_until(&mut channel, "server: hello").await;
    assert!(output.contains("hello\r\n"), "no echo in {output:?}");

    let (_term, line) = timeout(DEFAULT_TIMEOUT, reader).await.unwrap().unwrap();
    assert_eq!(line.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_write_while_reading_redraws_line() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    start_shell(&mut channel).await;

    let reader = tokio::spawn({
        let term = term.clone();
        async move { term.read_line().await }
    });
    read_until(&mut channel, "> ").await;
    channel.data(&b"par"[..]).await.unwrap();
    read_until(&mut channel, "par").await;

    term.write_line("notice").await.unwrap();
    let output = read_until(&mut channel, "> par").await;
    assert!(output.contains("\r\x1b[Knotice\r\n"), "got {output:?}");

    channel.data(&b"tial\r"[..]).await.unwrap();
    let line = timeout(DEFAULT_TIMEOUT, reader).await.unwrap().unwrap();
    assert_eq!(line.unwrap().as_deref(), Some("partial"));
}

#[tokio::test]
async fn test_refused_channel_does_not_emit_session() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(client.auth_none("tunnel").await);
    let forwarded = client
        .handle
        .channel_open_direct_tcpip("localhost", 80, "127.0.0.1", 5000)
        .await;
    assert!(forwarded.is_err());
    server.expect_no_terminal(Duration::from_millis(200)).await;
    client.disconnect().await;

    let (_client, _channel) = TestClient::anonymous(server.addr(), "later").await;
    let term = server.next_terminal().await;
    assert_eq!(term.user(), "later");
}

#[tokio::test]
async fn test_server_closes_connection_without_session_channel() {
    let options = test_options()
        .negotiation_timeout(Some(Duration::from_millis(300)))
        .build()
        .unwrap();
    let mut server = TestServer::start_with(options, Arc::new(OpenPolicy)).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(client.auth_none("tunnel").await);
    let forwarded = client
        .handle
        .channel_open_direct_tcpip("localhost", 80, "127.0.0.1", 5000)
        .await;
    assert!(forwarded.is_err());

    client.wait_disconnected().await;
    server.expect_no_terminal(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_idle_sockets_do_not_stall_accepting() {
    let options = test_options().session_backlog(2).build().unwrap();
    let mut server = TestServer::start_with(options, Arc::new(OpenPolicy)).await;

    let mut idle = Vec::new();
    for _ in 0..4 {
        idle.push(TcpStream::connect(server.addr()).await.unwrap());
    }

    let (_client, _channel) = TestClient::anonymous(server.addr(), "real").await;
    let term = server.next_terminal().await;
    assert_eq!(term.user(), "real");
    drop(idle);
}

#[tokio::test]
async fn test_negotiation_timeout_drops_idle_connection() {
    let options = test_options()
        .negotiation_timeout(Some(Duration::from_millis(200)))
        .build()
        .unwrap();
    let mut server = TestServer::start_with(options, Arc::new(OpenPolicy)).await;

    let mut client = TestClient::connect(server.addr()).await;
    assert!(client.auth_none("idle").await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.handle.channel_open_session().await.is_err());
    server.expect_no_terminal(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_close_ends_stream_but_keeps_sessions() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    start_shell(&mut channel).await;

    server.listener.close().unwrap();
    server.listener.close().unwrap();
    assert!(server.listener.is_closed());
    let next = timeout(DEFAULT_TIMEOUT, server.terminals.next())
        .await
        .expect("stream did not end");
    assert!(next.is_none());

    term.write_line("still here").await.unwrap();
    read_until(&mut channel, "still here").await;
    assert!(matches!(
        server.listener.serve_terminals(),
        Err(Error::ListenerClosed)
    ));
}

#[tokio::test]
async fn test_serve_terminals_twice() {
    let server = TestServer::start(Arc::new(OpenPolicy)).await;
    assert!(matches!(
        server.listener.serve_terminals(),
        Err(Error::AlreadyServing)
    ));
}

#[tokio::test]
async fn test_bind_address_in_use() {
    let server = TestServer::start(Arc::new(OpenPolicy)).await;
    let options = ServerBuilder::new()
        .address(server.addr().to_string())
        .build()
        .unwrap();
    let result = Listener::bind(options, Arc::new(OpenPolicy)).await;
    match result {
        Err(Error::Bind { addr, .. }) => assert_eq!(addr, server.addr()),
        other => panic!("expected bind error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_close_disconnects_client() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;
    let (_client, mut channel) = TestClient::anonymous(server.addr(), "guest").await;
    let term = server.next_terminal().await;
    start_shell(&mut channel).await;

    term.close().unwrap();
    term.close().unwrap();
    wait_closed(&mut channel).await;
    assert!(matches!(term.write_line("late").await, Err(Error::ClosedSession)));
    assert!(matches!(term.read_line().await, Ok(None)));
}

#[tokio::test]
async fn test_sessions_arrive_in_negotiation_order() {
    let mut server = TestServer::start(Arc::new(OpenPolicy)).await;

    let (_first, _a) = TestClient::anonymous(server.addr(), "first").await;
    let term = server.next_terminal().await;
    assert_eq!(term.user(), "first");

    let (_second, _b) = TestClient::anonymous(server.addr(), "second").await;
    let term2 = server.next_terminal().await;
    assert_eq!(term2.user(), "second");
    assert_ne!(term.id(), term2.id());
}
