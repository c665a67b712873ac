//! Request-line/header parsing and response-head encoding.
//!
//! Parsing leans on `httparse` directly (rather than the stale
//! `Http1Transaction` trait this module used to implement) since the
//! engine only ever plays the server role.

use bytes::{Bytes, BytesMut};
use std::time::SystemTime;

use crate::error::Error;

pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;

pub(crate) struct ParsedRequest {
    pub(crate) method: Bytes,
    pub(crate) raw_path: Bytes,
    pub(crate) query_string: Bytes,
    pub(crate) http_version: &'static str,
    /// Lowercased header name/value byte pairs.
    pub(crate) headers: Vec<(Bytes, Bytes)>,
    pub(crate) content_length: Option<u64>,
    pub(crate) is_chunked: bool,
    pub(crate) expect_continue: bool,
    pub(crate) connection_close: bool,
    pub(crate) upgrade_to: Option<Bytes>,
}

pub(crate) enum Parsed {
    Complete { request: ParsedRequest, consumed: usize },
    Partial,
}

/// Attempts to parse one request line + header block from the front of
/// `buf`. Does not consume `buf`; the caller advances by `consumed` bytes
/// once the body framing has been determined.
pub(crate) fn parse_request(buf: &[u8], max_headers: usize) -> Result<Parsed, Error> {
    let mut header_storage = vec![httparse::EMPTY_HEADER; max_headers];
    let mut req = httparse::Request::new(&mut header_storage);

    let status = req
        .parse(buf)
        .map_err(|_| Error::new_parse("malformed request line or headers"))?;

    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(Parsed::Partial),
    };

    let method = Bytes::copy_from_slice(req.method.unwrap_or("").as_bytes());
    let path = req.path.unwrap_or("/");
    let (raw_path, query_string) = match path.find('?') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    };

    let http_version = match req.version {
        Some(1) => "1.1",
        Some(0) => "1.0",
        _ => return Err(Error::new_parse("unsupported HTTP version")),
    };

    let mut headers = Vec::with_capacity(req.headers.len());
    let mut content_length = None;
    let mut is_chunked = false;
    let mut expect_continue = false;
    let mut connection_close = http_version == "1.0";
    let mut upgrade_to = None;

    for header in req.headers.iter() {
        let name_lower = header.name.to_ascii_lowercase();
        let value = Bytes::copy_from_slice(header.value);

        match name_lower.as_str() {
            "content-length" => {
                let parsed = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::new_parse("invalid Content-Length"))?;
                if content_length.is_some() && content_length != Some(parsed) {
                    return Err(Error::new_parse("conflicting Content-Length headers"));
                }
                content_length = Some(parsed);
            }
            "transfer-encoding" => {
                if value
                    .as_ref()
                    .to_ascii_lowercase()
                    .windows(7)
                    .any(|w| w == b"chunked")
                {
                    is_chunked = true;
                }
            }
            "expect" => {
                if value.eq_ignore_ascii_case(b"100-continue") {
                    expect_continue = true;
                }
            }
            "connection" => {
                let lower = value.as_ref().to_ascii_lowercase();
                for token in lower.split(|&b| b == b',') {
                    let token = trim_ascii(token);
                    if token == b"close" {
                        connection_close = true;
                    } else if token == b"keep-alive" {
                        connection_close = false;
                    } else if token == b"upgrade" {
                        upgrade_to = Some(Bytes::new());
                    }
                }
            }
            "upgrade" => {
                upgrade_to = Some(value.clone());
            }
            _ => {}
        }

        headers.push((Bytes::from(name_lower.into_bytes()), value));
    }

    if is_chunked && content_length.is_some() {
        return Err(Error::new_parse(
            "both Content-Length and Transfer-Encoding: chunked present",
        ));
    }

    Ok(Parsed::Complete {
        request: ParsedRequest {
            method,
            raw_path: Bytes::copy_from_slice(raw_path.as_bytes()),
            query_string: Bytes::copy_from_slice(query_string.as_bytes()),
            http_version,
            headers,
            content_length,
            is_chunked,
            expect_continue,
            connection_close,
            upgrade_to,
        },
        consumed,
    })
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

/// Writes a `100 Continue` informational response.
pub(crate) fn write_continue(dst: &mut BytesMut) {
    dst.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

/// Writes the status line + headers for a response, including `Date` and
/// (when `extra_close` is set) an appended `Connection: close`.
pub(crate) fn write_response_head(
    status: u16,
    headers: &[(Bytes, Bytes)],
    extra_close: bool,
    dst: &mut BytesMut,
) {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");

    dst.extend_from_slice(b"HTTP/1.1 ");
    itoa::write(&mut *dst, status).expect("write to BytesMut is infallible");
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(reason.as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        dst.extend_from_slice(name);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value);
        dst.extend_from_slice(b"\r\n");
    }

    if extra_close {
        dst.extend_from_slice(b"Connection: close\r\n");
    }

    dst.extend_from_slice(b"Date: ");
    dst.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
    dst.extend_from_slice(b"\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let raw = b"GET /hello?x=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        match parse_request(raw, DEFAULT_MAX_HEADERS).unwrap() {
            Parsed::Complete { request, consumed } => {
                assert_eq!(consumed, raw.len());
                assert_eq!(&request.method[..], b"GET");
                assert_eq!(&request.raw_path[..], b"/hello");
                assert_eq!(&request.query_string[..], b"x=1");
                assert_eq!(request.http_version, "1.1");
                assert!(!request.connection_close);
                assert_eq!(request.headers[0].0.as_ref(), b"host");
            }
            Parsed::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn detects_expect_continue_and_chunked() {
        let raw = b"POST /u HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nTransfer-Encoding: chunked\r\n\r\n";
        match parse_request(raw, DEFAULT_MAX_HEADERS).unwrap() {
            Parsed::Complete { request, .. } => {
                assert!(request.expect_continue);
                assert!(request.is_chunked);
                assert!(request.content_length.is_none());
            }
            Parsed::Partial => panic!("expected complete parse"),
        }
    }

    #[test]
    fn partial_request_asks_for_more() {
        let raw = b"GET /hello HTTP/1.1\r\nHost: x\r\n";
        assert!(matches!(
            parse_request(raw, DEFAULT_MAX_HEADERS).unwrap(),
            Parsed::Partial
        ));
    }

    #[test]
    fn rejects_conflicting_length_and_chunked() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(parse_request(raw, DEFAULT_MAX_HEADERS).is_err());
    }

    #[test]
    fn connection_close_detected() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        match parse_request(raw, DEFAULT_MAX_HEADERS).unwrap() {
            Parsed::Complete { request, .. } => assert!(request.connection_close),
            Parsed::Partial => panic!("expected complete parse"),
        }
    }
}
