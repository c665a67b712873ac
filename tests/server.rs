//! Wire-level integration tests for the numbered scenarios in §8 of the
//! specification this crate implements: a real `Server` bound to an
//! ephemeral port, driven with raw `tokio::net::TcpStream` clients exactly
//! as a real HTTP/1.1 client would.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rasgi::handler::{handler_fn, ReceiveEvent, SendEvent};
use rasgi::{Config, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

type BoxErr = Box<dyn std::error::Error + Send + Sync>;

/// Starts a server on an OS-assigned port with the given handler, returning
/// its address and a handle to shut it down once the test is done.
async fn start<F>(handler: F) -> (SocketAddr, rasgi::ShutdownHandle)
where
    F: for<'a> Fn(
            rasgi::Scope,
            Box<dyn rasgi::handler::Receive + 'a>,
            Box<dyn rasgi::handler::Send_ + 'a>,
        ) -> rasgi::handler::BoxFuture<'a, Result<(), BoxErr>>
        + Send
        + Sync
        + 'static,
{
    let config = Config::new(handler_fn(handler))
        .host([127, 0, 0, 1].into())
        .port(0)
        .shutdown_threshold(Duration::from_millis(50));
    let server = Server::new(config).expect("bind should succeed on an ephemeral port");
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.serve());
    (addr, shutdown)
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

/// Reads whatever bytes arrive within a short window — enough for a test
/// server that has already finished writing its response, without relying
/// on EOF (the connection may be kept alive).
async fn read_available(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut buf = [0u8; 4096];
        match timeout(Duration::from_millis(300), stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => panic!("read error: {e}"),
            Err(_) => break,
        }
    }
    out
}

#[tokio::test]
async fn simple_get_returns_200_and_keeps_connection_open() {
    let (addr, shutdown) = start(|_scope, mut receive, mut send| {
        Box::pin(async move {
            let _ = receive.receive().await?;
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers: vec![(
                    Bytes::from_static(b"content-length"),
                    Bytes::from_static(b"2"),
                )],
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body: Bytes::from_static(b"hi"),
                more_body: false,
            })
            .await?;
            Ok(())
        })
    })
    .await;

    let mut client = connect(addr).await;
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_available(&mut client).await;
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("content-length: 2"), "got: {text}");
    assert!(text.ends_with("hi"), "got: {text}");
    // Connection was not told to close; a second pipelined request still works.
    client
        .write_all(b"GET /again HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let second = read_available(&mut client).await;
    assert!(String::from_utf8_lossy(&second).starts_with("HTTP/1.1 200 OK\r\n"));

    shutdown.forceful();
}

#[tokio::test]
async fn head_suppresses_body_but_not_headers() {
    let (addr, shutdown) = start(|_scope, mut receive, mut send| {
        Box::pin(async move {
            let _ = receive.receive().await?;
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers: vec![(
                    Bytes::from_static(b"content-length"),
                    Bytes::from_static(b"2"),
                )],
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body: Bytes::from_static(b"hi"),
                more_body: false,
            })
            .await?;
            Ok(())
        })
    })
    .await;

    let mut client = connect(addr).await;
    client
        .write_all(b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_available(&mut client).await;
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("content-length: 2"), "got: {text}");
    assert!(!text.ends_with("hi"), "HEAD must not carry a body: {text}");

    shutdown.forceful();
}

#[tokio::test]
async fn expect_100_continue_before_body() {
    let (addr, shutdown) = start(|_scope, mut receive, mut send| {
        Box::pin(async move {
            let event = receive.receive().await?;
            match event {
                ReceiveEvent::Request { body, more_body } => {
                    assert_eq!(&body[..], b"abc");
                    assert!(!more_body);
                }
                ReceiveEvent::Disconnect => panic!("expected a request body"),
            }
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers: vec![(
                    Bytes::from_static(b"content-length"),
                    Bytes::from_static(b"0"),
                )],
            })
            .await?;
            send.send(SendEvent::default()).await?;
            Ok(())
        })
    })
    .await;

    let mut client = connect(addr).await;
    client
        .write_all(b"POST /u HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n")
        .await
        .unwrap();

    let continue_line = read_available(&mut client).await;
    assert_eq!(&continue_line[..], b"HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"abc").await.unwrap();
    let response = read_available(&mut client).await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK\r\n"));

    shutdown.forceful();
}

#[tokio::test]
async fn pipelined_requests_answered_in_arrival_order() {
    let (addr, shutdown) = start(|scope, mut receive, mut send| {
        Box::pin(async move {
            let _ = receive.receive().await?;
            let body = Bytes::from(scope.path.clone().into_bytes());
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers: vec![(
                    Bytes::from_static(b"content-length"),
                    Bytes::from(body.len().to_string()),
                )],
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body,
                more_body: false,
            })
            .await?;
            Ok(())
        })
    })
    .await;

    let mut client = connect(addr).await;
    client
        .write_all(
            b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let response = read_available(&mut client).await;
    let text = String::from_utf8_lossy(&response);
    let first = text.find("/one").expect("first response body");
    let second = text.find("/two").expect("second response body");
    assert!(first < second, "responses arrived out of order: {text}");

    shutdown.forceful();
}

#[tokio::test]
async fn handler_exception_before_response_start_yields_canned_500() {
    let (addr, shutdown) = start(|_scope, mut receive, _send| {
        Box::pin(async move {
            let _ = receive.receive().await?;
            Err(Box::<dyn std::error::Error + Send + Sync>::from("boom"))
        })
    })
    .await;

    let mut client = connect(addr).await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_available(&mut client).await;
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "got: {text}");
    assert!(text.contains("Connection: close"), "got: {text}");
    assert!(text.ends_with("Internal Server Error"), "got: {text}");

    // Connection: close means no further bytes should be accepted/answered.
    let mut probe = [0u8; 1];
    let eof = timeout(Duration::from_millis(300), client.read(&mut probe)).await;
    assert!(matches!(eof, Ok(Ok(0))) || eof.is_err(), "connection should be closing");

    shutdown.forceful();
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_request_then_exits() {
    let (addr, shutdown) = start(|_scope, mut receive, mut send| {
        Box::pin(async move {
            let _ = receive.receive().await?;
            tokio::time::sleep(Duration::from_millis(150)).await;
            send.send(SendEvent::ResponseStart {
                status: 200,
                headers: vec![(
                    Bytes::from_static(b"content-length"),
                    Bytes::from_static(b"2"),
                )],
            })
            .await?;
            send.send(SendEvent::ResponseBody {
                body: Bytes::from_static(b"ok"),
                more_body: false,
            })
            .await?;
            Ok(())
        })
    })
    .await;

    let mut client = connect(addr).await;
    client
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // Trigger shutdown while the handler is still sleeping.
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.graceful();

    let response = read_available(&mut client).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "in-flight request should still complete: {text}");
    assert!(text.ends_with("ok"));
}
