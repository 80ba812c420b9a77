//! Integration tests for the device link against real TCP endpoints.

use labdaq::config::LinkSettings;
use labdaq::error::DaqError;
use labdaq::link::DeviceLink;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

fn fast_settings() -> LinkSettings {
    LinkSettings {
        connect_retries: 2,
        retry_delay: Duration::from_millis(10),
        reply_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(20),
        keepalive_interval: Duration::from_millis(50),
    }
}

/// Echo-style instrument: answers every line with `<line>-reply\n`.
async fn spawn_echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = format!("{line}-reply\n");
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, task)
}

#[tokio::test]
async fn test_sequential_replies_do_not_leak() {
    let (addr, server) = spawn_echo_server().await;
    let link = DeviceLink::new("cam", "127.0.0.1", addr.port(), b"\n", fast_settings());
    link.connect().await.unwrap();

    let r1 = link.send_and_wait(b"alpha\n").await.unwrap();
    assert_eq!(&r1[..], b"alpha-reply\n");

    let r2 = link.send_and_wait(b"beta\n").await.unwrap();
    assert_eq!(&r2[..], b"beta-reply\n");
    assert!(!r2.windows(5).any(|w| w == b"alpha"));

    link.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn test_terminator_split_across_reads_is_reassembled() {
    // Server writes the reply in three chunks, with the two-byte
    // terminator itself split across the last two writes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf).await.unwrap();
        for chunk in [&b"PART"[..], &b"IAL-DATA\r"[..], &b"\n"[..]] {
            stream.write_all(chunk).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        // Keep the connection open until the client is done.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let link = DeviceLink::new("cam", "127.0.0.1", addr.port(), b"\r\n", fast_settings());
    link.connect().await.unwrap();

    let reply = link.send_and_wait(b"READ\r\n").await.unwrap();
    assert_eq!(&reply[..], b"PARTIAL-DATA\r\n");

    link.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn test_connect_retries_exhaust() {
    // Grab a port and immediately free it so nothing is listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let link = DeviceLink::new("cam", "127.0.0.1", port, b"\n", fast_settings());
    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, DaqError::ConnectivityLost(_)), "got {err}");
    assert!(!link.is_connected());
}

#[tokio::test]
async fn test_reply_timeout_when_device_is_silent() {
    // Accepts the connection but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut settings = fast_settings();
    settings.reply_timeout = Duration::from_millis(150);
    let link = DeviceLink::new("cam", "127.0.0.1", addr.port(), b"\n", settings);
    link.connect().await.unwrap();

    let err = link.send_and_wait(b"STATUS\n").await.unwrap_err();
    assert!(matches!(err, DaqError::Timeout(_)), "got {err}");

    link.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn test_keep_alive_detects_disconnection() {
    // Answers the first probe, then closes the connection.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        if let Ok(Some(_)) = lines.next_line().await {
            let _ = write_half.write_all(b"OK\n").await;
        }
        // Dropping both halves closes the socket.
    });

    let link = Arc::new(DeviceLink::new(
        "cam",
        "127.0.0.1",
        addr.port(),
        b"\n",
        fast_settings(),
    ));
    link.connect().await.unwrap();
    let keepalive = link.clone().spawn_keep_alive(b"STATUS\n".to_vec());

    // First probe succeeds, the second sees the dead connection and the
    // watchdog tears the link down.
    let mut disconnected = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !link.is_connected() {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected, "keep-alive did not mark the link disconnected");

    // A command on the torn-down link fails immediately.
    let err = link.send_and_wait(b"STATUS\n").await.unwrap_err();
    assert!(err.is_disconnection(), "got {err}");

    link.shutdown().await;
    keepalive.abort();
    server.abort();
}

#[tokio::test]
async fn test_restart_after_close() {
    let (addr, server) = spawn_echo_server().await;
    let link = DeviceLink::new("cam", "127.0.0.1", addr.port(), b"\n", fast_settings());
    link.connect().await.unwrap();
    link.close().await;
    assert!(!link.is_connected());

    link.restart().await.unwrap();
    let reply = link.send_and_wait(b"ping\n").await.unwrap();
    assert_eq!(&reply[..], b"ping-reply\n");

    link.shutdown().await;
    server.abort();
}
