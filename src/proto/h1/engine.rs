//! The per-connection HTTP/1.1 Protocol Engine (§4.C): drives one accepted
//! TCP connection from bytes to request scopes to response bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::config::{Config, HIGH_WATER_LIMIT};
use crate::error::Error;
use crate::flow::FlowControl;
use crate::handler::Handler;
use crate::proto::h1::cycle::{self, CycleHandle, CycleMessage, CycleOutcome};
use crate::proto::h1::decode::{Decoded, Decoder};
use crate::proto::h1::encode::Encoder;
use crate::proto::h1::io::Buffered;
use crate::proto::h1::role::{self, Parsed, DEFAULT_MAX_HEADERS};
use crate::scope::{self, Scope, ASGI_VERSION};
use crate::state::{ConnectionWatch, ServerState};

const CANNED_500: &[u8] = b"Internal Server Error";

/// Drives one accepted connection to completion. Returns once the socket is
/// closed, in either direction.
pub(crate) async fn serve_connection<H: Handler>(
    io: TcpStream,
    config: Arc<Config<H>>,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    scheme: &'static str,
) {
    let (connection_id, watch) = state.register_connection();
    let flow = FlowControl::new();
    let io = Buffered::new(io, flow.clone());

    let result = drive(
        io,
        &config,
        &state,
        &flow,
        &watch,
        local_addr,
        peer_addr,
        scheme,
    )
    .await;

    if let Err(err) = result {
        debug!(connection = connection_id, error = %err, "connection ended with error");
    }
    state.deregister_connection(connection_id);
}

#[allow(clippy::too_many_arguments)]
async fn drive<H: Handler>(
    mut io: Buffered<TcpStream>,
    config: &Arc<Config<H>>,
    state: &ServerState,
    flow: &FlowControl,
    watch: &ConnectionWatch,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    scheme: &'static str,
) -> Result<(), Error> {
    let mut shutting_down = false;

    loop {
        // Parse the next request line + headers out of whatever is already
        // buffered before asking the transport for more — this is what
        // gives pipelined requests "PAUSED"-then-resume treatment for free:
        // the second request just sits in `read_buf` while the first
        // cycle runs.
        let parsed = loop {
            match role::parse_request(&io.read_buf, DEFAULT_MAX_HEADERS) {
                Ok(Parsed::Complete { request, consumed }) => break Some((request, consumed)),
                Ok(Parsed::Partial) => {
                    if io.read_buf.len() > config.max_incomplete_event_size {
                        return Err(Error::new_parse("request head exceeded max_incomplete_event_size"));
                    }
                    if shutting_down {
                        return Ok(());
                    }
                    tokio::select! {
                        biased;
                        _ = watch.watch() => {
                            shutting_down = true;
                            continue;
                        }
                        n = io.read_more() => {
                            if n.map_err(Error::new_io)? == 0 {
                                break None;
                            }
                        }
                    }
                }
                Err(err) => return Err(write_400_and_close(&mut io, &err).await),
            }
        };

        let (request, consumed) = match parsed {
            Some(pair) => pair,
            None => return Ok(()),
        };
        io.read_buf.advance(consumed);
        state.record_request();

        if let Some(upgrade_to) = request.upgrade_to.clone() {
            if let Some(handler) = config.upgrade_handler.clone() {
                let scope = build_scope(&request, config, local_addr, peer_addr, scheme);
                let (stream, _leftover) = io.into_parts();
                handler.upgrade(scope, upgrade_to, stream);
                return Ok(());
            }
            return Err(write_400_and_close(&mut io, &Error::new_parse("unsupported upgrade")).await);
        }

        let scope = build_scope(&request, config, local_addr, peer_addr, scheme);
        let method = request.method.clone();
        let path = scope.path.clone();
        let http_version = request.http_version;
        let client_desc = peer_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".into());
        let is_head = method.eq_ignore_ascii_case(b"HEAD");

        let mut body_decoder = if request.is_chunked {
            Decoder::chunked()
        } else {
            Decoder::length(request.content_length.unwrap_or(0))
        };

        let mut handle = cycle::spawn_cycle(
            config.app.clone(),
            scope,
            flow.clone(),
            request.connection_close,
            request.expect_continue,
            is_head,
            state.clone(),
        );

        let mut encoder: Option<Encoder> = None;
        let mut body_done = body_decoder.is_eof();
        let mut status_for_log: u16 = 0;

        // A bodyless request (no `Content-Length`, or `Content-Length: 0`)
        // never reaches `feed_body`, which is otherwise the only producer
        // of body events — without this, `receive()` would block forever
        // waiting for a delivery that never comes.
        if body_done {
            handle.shared.deliver_body(Bytes::new(), false);
        }

        let outcome = 'cycle: loop {
            if !body_done && !flow.is_read_paused() {
                tokio::select! {
                    biased;
                    msg = handle.messages.recv() => {
                        handle_message(&mut io, msg, &mut encoder, &mut status_for_log).await?;
                    }
                    result = &mut handle.join => {
                        break 'cycle cycle::classify_outcome(result, &handle.shared);
                    }
                    n = io.read_more() => {
                        let n = n.map_err(Error::new_io)?;
                        if n == 0 {
                            handle.shared.mark_disconnected();
                            body_done = true;
                        } else {
                            feed_body(&mut io, &mut body_decoder, &handle, &mut body_done)?;
                        }
                    }
                    _ = watch.watch(), if !shutting_down => {
                        shutting_down = true;
                        handle.shared.clear_keep_alive();
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    msg = handle.messages.recv() => {
                        handle_message(&mut io, msg, &mut encoder, &mut status_for_log).await?;
                    }
                    result = &mut handle.join => {
                        break 'cycle cycle::classify_outcome(result, &handle.shared);
                    }
                    _ = watch.watch(), if !shutting_down => {
                        shutting_down = true;
                        handle.shared.clear_keep_alive();
                    }
                }
            }
        };

        match outcome {
            CycleOutcome::Completed => {
                state.record_response_complete();
                info!(client = %client_desc, method = %String::from_utf8_lossy(&method[..]), path = %path, version = http_version, status = status_for_log, "request completed");
            }
            CycleOutcome::NoResponseStarted => {
                write_canned_500(&mut io).await?;
                state.record_response_complete();
                warn!(client = %client_desc, "handler returned without starting a response");
            }
            CycleOutcome::Incomplete => {
                warn!(client = %client_desc, "handler left response incomplete; closing connection");
                return Ok(());
            }
        }

        if !body_done {
            // Handler completed without consuming the whole request body;
            // the connection can't be trusted to be framed correctly for a
            // next request, so close rather than guess.
            return Ok(());
        }

        if !handle.shared.keep_alive() || shutting_down {
            return Ok(());
        }

        keep_alive_wait(&mut io, watch, config.timeout_keep_alive).await?;
        if io.read_buf.is_empty() {
            // Timed out or peer closed with nothing pending.
            return Ok(());
        }
    }
}

/// Splits one I/O failure into two independent `Error`s (`Error` isn't
/// `Clone`) so both the cycle's ack channel and this function's own return
/// path can report it.
fn io_err_pair(e: std::io::Error) -> (Error, Error) {
    let copy = std::io::Error::new(e.kind(), e.to_string());
    (Error::new_io(e), Error::new_io(copy))
}

async fn handle_message(
    io: &mut Buffered<TcpStream>,
    msg: Option<CycleMessage>,
    encoder: &mut Option<Encoder>,
    status_for_log: &mut u16,
) -> Result<(), Error> {
    match msg {
        None => Ok(()),
        Some(CycleMessage::WriteContinue) => {
            let mut scratch = BytesMut::new();
            role::write_continue(&mut scratch);
            io.buffer(&scratch);
            io.flush().await.map_err(Error::new_io)
        }
        Some(CycleMessage::Head { status, headers, ack }) => {
            *status_for_log = status;
            *encoder = Some(select_encoder(&headers));
            let extra_close = false; // `Connection: close` already folded into `headers` by the cycle.
            let mut scratch = BytesMut::new();
            role::write_response_head(status, &headers, extra_close, &mut scratch);
            io.buffer(&scratch);
            match io.flush().await {
                Ok(()) => {
                    let _ = ack.send(Ok(()));
                    Ok(())
                }
                Err(e) => {
                    let (for_ack, for_return) = io_err_pair(e);
                    let _ = ack.send(Err(for_ack));
                    Err(for_return)
                }
            }
        }
        Some(CycleMessage::Body { body, more_body, ack }) => {
            let mut scratch = BytesMut::new();
            if let Some(enc) = encoder.as_mut() {
                enc.encode(&body, &mut scratch);
                if !more_body {
                    enc.encode_end(&mut scratch);
                }
            } else {
                scratch.extend_from_slice(&body);
            }
            io.buffer(&scratch);
            match io.flush().await {
                Ok(()) => {
                    let _ = ack.send(Ok(()));
                    Ok(())
                }
                Err(e) => {
                    let (for_ack, for_return) = io_err_pair(e);
                    let _ = ack.send(Err(for_ack));
                    Err(for_return)
                }
            }
        }
    }
}

fn select_encoder(headers: &[(Bytes, Bytes)]) -> Encoder {
    let mut will_close = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(b"content-length") {
            if let Ok(len) = std::str::from_utf8(value).unwrap_or("").parse::<u64>() {
                return Encoder::length(len);
            }
        }
        if name.eq_ignore_ascii_case(b"connection") && value.eq_ignore_ascii_case(b"close") {
            will_close = true;
        }
    }
    // No declared length: frame with chunked encoding so the connection can
    // stay alive, unless it's closing anyway, in which case the close
    // itself delimits the body and chunked framing would be pointless.
    if will_close {
        Encoder::close_delimited()
    } else {
        Encoder::chunked()
    }
}

fn feed_body(
    io: &mut Buffered<TcpStream>,
    decoder: &mut Decoder,
    handle: &CycleHandle,
    body_done: &mut bool,
) -> Result<(), Error> {
    loop {
        match decoder.decode(&mut io.read_buf)? {
            Some(Decoded::Data(bytes)) => {
                handle.shared.deliver_body(bytes, true);
                if io.read_buf.len() > HIGH_WATER_LIMIT {
                    // Backpressure: stop pulling more off the wire until the
                    // handler asks for the next chunk via `receive()`.
                    return Ok(());
                }
            }
            Some(Decoded::Done) => {
                handle.shared.deliver_body(Bytes::new(), false);
                *body_done = true;
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}

fn build_scope<H>(
    request: &role::ParsedRequest,
    config: &Arc<Config<H>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    scheme: &'static str,
) -> Scope {
    Scope {
        http_version: request.http_version,
        method: request.method.clone(),
        scheme,
        root_path: config.root_path.clone(),
        path: scope::percent_decode(&request.raw_path),
        raw_path: request.raw_path.clone(),
        query_string: request.query_string.clone(),
        headers: request.headers.clone(),
        server: local_addr.map(|a| (a.ip(), a.port())),
        client: peer_addr.map(|a| (a.ip(), a.port())),
        asgi: ASGI_VERSION,
    }
}

async fn write_400_and_close(io: &mut Buffered<TcpStream>, err: &Error) -> Error {
    let body = format!("Bad Request: {}\n", err);
    let headers = [
        (Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain; charset=utf-8")),
        (Bytes::from_static(b"content-length"), Bytes::from(body.len().to_string())),
    ];
    let mut scratch = BytesMut::new();
    role::write_response_head(400, &headers, true, &mut scratch);
    scratch.extend_from_slice(body.as_bytes());
    io.buffer(&scratch);
    let _ = io.flush().await;
    let _ = io.shutdown().await;
    Error::new_parse("malformed request")
}

async fn write_canned_500(io: &mut Buffered<TcpStream>) -> Result<(), Error> {
    let headers = [
        (Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain; charset=utf-8")),
        (Bytes::from_static(b"content-length"), Bytes::from(CANNED_500.len().to_string())),
    ];
    let mut scratch = BytesMut::new();
    role::write_response_head(500, &headers, true, &mut scratch);
    scratch.extend_from_slice(CANNED_500);
    io.buffer(&scratch);
    io.flush().await.map_err(Error::new_io)?;
    io.shutdown().await.map_err(Error::new_io)
}

/// Waits for either the keep-alive timeout to fire or more bytes (or a
/// shutdown signal) to arrive; cancels idiomatically by simply dropping the
/// `Sleep` future when bytes beat the clock.
async fn keep_alive_wait(
    io: &mut Buffered<TcpStream>,
    watch: &ConnectionWatch,
    timeout: Duration,
) -> Result<(), Error> {
    let sleep_fut: Sleep = sleep(timeout);
    tokio::pin!(sleep_fut);
    tokio::select! {
        biased;
        _ = watch.watch() => Ok(()),
        _ = &mut sleep_fut => Ok(()),
        n = io.read_more() => {
            n.map_err(Error::new_io)?;
            Ok(())
        }
    }
}
