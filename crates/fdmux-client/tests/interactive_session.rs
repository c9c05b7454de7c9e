//! Integration tests for the interactive client against a real TCP peer.
//!
//! A plain `std` listener plays the server in a background thread; the
//! session connects with the non-blocking connector and runs on the `poll`
//! backend with an in-process console.  Unix-domain sockets live in a
//! temporary directory.

use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fdmux_client::application::session::{InteractiveSession, SessionEnd};
use fdmux_client::application::{run_interactive, ClientError, ClientSettings};
use fdmux_net::{connect_tcp, connect_unix, create, BackendKind, ConnectOptions, Console, Endpoint};

fn options() -> ConnectOptions {
    ConnectOptions {
        attempts: 2,
        timeout: Duration::from_secs(2),
        retry_delay: Duration::ZERO,
        backend: BackendKind::Poll,
    }
}

#[test]
fn test_quit_delivers_pending_server_reply_before_ending() {
    // Arrange: the server waits for the client's end-of-stream, then replies
    // and closes.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut inbound = Vec::new();
        stream.read_to_end(&mut inbound).unwrap();
        stream.write_all(b"goodbye").unwrap();
        inbound
    });

    let connection = connect_tcp(addr, &options()).unwrap();
    let (console_end, mut operator) = UnixStream::pair().unwrap();
    let mut session = InteractiveSession::new(
        create(BackendKind::Poll).unwrap(),
        connection,
        Console::new(console_end),
        Some(Duration::from_secs(2)),
        1024,
    )
    .with_output(Box::new(io::sink()));

    // Act
    operator.write_all(b"hello\nquit\n").unwrap();
    let end = session.run().unwrap();

    // Assert
    assert_eq!(end, SessionEnd::Quit);
    assert_eq!(server.join().unwrap(), b"helloquit");
}

#[test]
fn test_server_hangup_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"bye").unwrap();
    });

    let connection = connect_tcp(addr, &options()).unwrap();
    let (console_end, _operator) = UnixStream::pair().unwrap();
    let mut session = InteractiveSession::new(
        create(BackendKind::Poll).unwrap(),
        connection,
        Console::new(console_end),
        Some(Duration::from_secs(2)),
        1024,
    )
    .with_output(Box::new(io::sink()));

    server.join().unwrap();
    let end = session.run().unwrap();

    assert_eq!(end, SessionEnd::ServerClosed);
}

#[test]
fn test_unix_session_sends_and_drains_over_socket_file() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fdmux.sock");
    let listener = UnixListener::bind(&path).unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut inbound = Vec::new();
        stream.read_to_end(&mut inbound).unwrap();
        stream.write_all(b"ack").unwrap();
        inbound
    });

    let connection = connect_unix(&path).unwrap();
    let (console_end, mut operator) = UnixStream::pair().unwrap();
    let mut session = InteractiveSession::new(
        create(BackendKind::Poll).unwrap(),
        connection,
        Console::new(console_end),
        Some(Duration::from_secs(2)),
        1024,
    )
    .with_output(Box::new(io::sink()));

    // Act
    operator.write_all(b"over unix\n").unwrap();
    drop(operator);
    let end = session.run().unwrap();

    // Assert: console end-of-input drains like `quit`.
    assert_eq!(end, SessionEnd::Quit);
    assert_eq!(server.join().unwrap(), b"over unix");
}

#[test]
fn test_missing_unix_socket_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::Unix(dir.path().join("absent.sock"));

    let err = run_interactive(
        &endpoint,
        &ClientSettings::default(),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap_err();

    assert!(matches!(err, ClientError::Connect(_)));
}
