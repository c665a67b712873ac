//! Incremental request-body decoder.
//!
//! Unlike the async, pull-on-demand decoder this is descended from, this
//! one runs sans-io: the engine hands it whatever bytes have already been
//! read off the socket into a `BytesMut`, and `decode()` consumes as much
//! of the body as it can from what's there, reporting back whether it
//! needs more bytes before it can make progress. This matches the rest of
//! the protocol engine's "feed bytes, drain events" shape.

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::Error;

/// Maximum amount of bytes allowed in chunked extensions, applied across
/// the whole body rather than per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Length(u64),
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
    },
    /// No Content-Length and no chunked Transfer-Encoding: body runs until
    /// the connection closes. Only legal for a close-delimited response;
    /// requests with neither header carry no body.
    Eof(bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    TrailerLine,
    End,
}

/// One step of progress decoding a body.
pub(crate) enum Decoded {
    /// A chunk of body bytes, consumed from the front of the input buffer.
    Data(Bytes),
    /// The body is fully consumed; no more `Data` will follow.
    Done,
}

impl Decoder {
    pub(crate) fn length(n: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(n),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Size,
                chunk_len: 0,
                extensions_cnt: 0,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Kind::Length(0) | Kind::Chunked { state: ChunkedState::End, .. }
        )
    }

    /// Consume as much body as is currently buffered.
    ///
    /// Returns `Ok(None)` when the buffer doesn't yet hold enough bytes to
    /// make progress (e.g. a chunk-size line is still incomplete); the
    /// caller should wait for more bytes and call again.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, Error> {
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Some(Decoded::Done));
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                let to_take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                let chunk = buf.split_to(to_take).freeze();
                *remaining -= chunk.len() as u64;
                Ok(Some(Decoded::Data(chunk)))
            }
            Kind::Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
            } => loop {
                if *state == ChunkedState::End {
                    return Ok(Some(Decoded::Done));
                }
                match step(state, chunk_len, extensions_cnt, buf)? {
                    Some(Step::Data(bytes)) => return Ok(Some(Decoded::Data(bytes))),
                    Some(Step::Continue) => continue,
                    None => return Ok(None),
                }
            },
            Kind::Eof(ref mut is_eof) => {
                if *is_eof {
                    return Ok(Some(Decoded::Done));
                }
                if buf.is_empty() {
                    return Ok(None);
                }
                let chunk = buf.split_to(buf.len()).freeze();
                Ok(Some(Decoded::Data(chunk)))
            }
        }
    }

    /// Called on connection close while this decoder is still open;
    /// `Eof`-kind bodies end cleanly, anything else is an incomplete
    /// message.
    pub(crate) fn end_on_close(&mut self) -> Result<(), Error> {
        match self.kind {
            Kind::Eof(ref mut is_eof) => {
                *is_eof = true;
                Ok(())
            }
            Kind::Length(0) => Ok(()),
            Kind::Chunked {
                state: ChunkedState::End,
                ..
            } => Ok(()),
            _ => Err(Error::new_incomplete_message()),
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

enum Step {
    Data(Bytes),
    Continue,
}

fn step(
    state: &mut ChunkedState,
    chunk_len: &mut u64,
    extensions_cnt: &mut u64,
    buf: &mut BytesMut,
) -> Result<Option<Step>, Error> {
    use ChunkedState::*;
    match *state {
        Size => {
            while !buf.is_empty() {
                let b = buf[0];
                match b {
                    b'0'..=b'9' => {
                        *chunk_len = chunk_len
                            .checked_mul(16)
                            .and_then(|v| v.checked_add((b - b'0') as u64))
                            .ok_or_else(|| Error::new_parse("invalid chunk size: overflow"))?;
                        buf.advance(1);
                    }
                    b'a'..=b'f' => {
                        *chunk_len = chunk_len
                            .checked_mul(16)
                            .and_then(|v| v.checked_add((b - b'a' + 10) as u64))
                            .ok_or_else(|| Error::new_parse("invalid chunk size: overflow"))?;
                        buf.advance(1);
                    }
                    b'A'..=b'F' => {
                        *chunk_len = chunk_len
                            .checked_mul(16)
                            .and_then(|v| v.checked_add((b - b'A' + 10) as u64))
                            .ok_or_else(|| Error::new_parse("invalid chunk size: overflow"))?;
                        buf.advance(1);
                    }
                    b'\t' | b' ' => {
                        buf.advance(1);
                        *state = SizeLws;
                        return Ok(Some(Step::Continue));
                    }
                    b';' => {
                        buf.advance(1);
                        *state = Extension;
                        return Ok(Some(Step::Continue));
                    }
                    b'\r' => {
                        buf.advance(1);
                        *state = SizeLf;
                        return Ok(Some(Step::Continue));
                    }
                    _ => return Err(Error::new_parse("invalid chunk size line")),
                }
            }
            Ok(None)
        }
        SizeLws => consume_until_crlf_start(buf, state, Extension, SizeLf),
        Extension => {
            while !buf.is_empty() {
                let b = buf[0];
                buf.advance(1);
                match b {
                    b'\r' => {
                        *state = SizeLf;
                        return Ok(Some(Step::Continue));
                    }
                    b'\n' => return Err(Error::new_parse("invalid chunk extension newline")),
                    _ => {
                        *extensions_cnt += 1;
                        if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                            return Err(Error::new_parse("chunk extensions over limit"));
                        }
                    }
                }
            }
            Ok(None)
        }
        SizeLf => {
            if buf.is_empty() {
                return Ok(None);
            }
            let b = buf[0];
            buf.advance(1);
            if b != b'\n' {
                return Err(Error::new_parse("invalid chunk size LF"));
            }
            if *chunk_len == 0 {
                trace!("final chunk, scanning trailers");
                *state = TrailerLine;
            } else {
                debug!("chunk of {} bytes", chunk_len);
                *state = Body;
            }
            Ok(Some(Step::Continue))
        }
        Body => {
            if buf.is_empty() {
                return Ok(None);
            }
            let to_take = std::cmp::min(*chunk_len, buf.len() as u64) as usize;
            let data = buf.split_to(to_take).freeze();
            *chunk_len -= data.len() as u64;
            if *chunk_len == 0 {
                *state = BodyCr;
            }
            Ok(Some(Step::Data(data)))
        }
        BodyCr => consume_byte(buf, state, b'\r', BodyLf, "invalid chunk body CR"),
        BodyLf => {
            let advanced = consume_byte(buf, state, b'\n', Size, "invalid chunk body LF")?;
            if advanced.is_some() {
                *chunk_len = 0;
            }
            Ok(advanced)
        }
        TrailerLine => {
            // Trailers are not surfaced to the handler contract; scan and
            // discard lines until the blank line that ends the section.
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let line = buf.split_to(pos + 1);
                    let content_len = if line.len() >= 2 && line[line.len() - 2] == b'\r' {
                        line.len() - 2
                    } else {
                        line.len() - 1
                    };
                    if content_len == 0 {
                        *state = End;
                    }
                    Ok(Some(Step::Continue))
                }
                None => Ok(None),
            }
        }
        End => Ok(Some(Step::Continue)),
    }
}

fn consume_byte(
    buf: &mut BytesMut,
    state: &mut ChunkedState,
    expect: u8,
    next: ChunkedState,
    msg: &'static str,
) -> Result<Option<Step>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }
    let b = buf[0];
    buf.advance(1);
    if b != expect {
        return Err(Error::new_parse(msg));
    }
    *state = next;
    Ok(Some(Step::Continue))
}

fn consume_until_crlf_start(
    buf: &mut BytesMut,
    state: &mut ChunkedState,
    ext_state: ChunkedState,
    lf_state: ChunkedState,
) -> Result<Option<Step>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }
    let b = buf[0];
    match b {
        b'\t' | b' ' => {
            buf.advance(1);
            Ok(Some(Step::Continue))
        }
        b';' => {
            buf.advance(1);
            *state = ext_state;
            Ok(Some(Step::Continue))
        }
        b'\r' => {
            buf.advance(1);
            *state = lf_state;
            Ok(Some(Step::Continue))
        }
        _ => Err(Error::new_parse("invalid chunk size linear white space")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut decoder: Decoder, mut buf: BytesMut) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut buf).expect("decode") {
                Some(Decoded::Data(b)) => out.extend_from_slice(&b),
                Some(Decoded::Done) => return (out, true),
                None => return (out, false),
            }
        }
    }

    #[test]
    fn length_decodes_exact_bytes() {
        let (out, done) = drain(Decoder::length(6), BytesMut::from(&b"foobar"[..]));
        assert_eq!(out, b"foobar");
        assert!(done);
    }

    #[test]
    fn length_zero_is_immediately_done() {
        let mut decoder = Decoder::length(0);
        let mut buf = BytesMut::new();
        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Some(Decoded::Done)
        ));
    }

    #[test]
    fn chunked_single_chunk() {
        let (out, _done) = drain(
            Decoder::chunked(),
            BytesMut::from(&b"6\r\nfoobar\r\n0\r\n\r\n"[..]),
        );
        assert_eq!(out, b"foobar");
    }

    #[test]
    fn chunked_multiple_chunks() {
        let (out, _done) = drain(
            Decoder::chunked(),
            BytesMut::from(&b"3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n"[..]),
        );
        assert_eq!(out, b"foobar");
    }

    #[test]
    fn chunked_waits_for_more_bytes() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"3\r\nfo"[..]);
        match decoder.decode(&mut buf).unwrap() {
            Some(Decoded::Data(b)) => assert_eq!(&b[..], b"fo"),
            other => panic!("expected partial data, got {:?}", other.is_some()),
        }
        assert!(matches!(decoder.decode(&mut buf).unwrap(), None));
        buf.extend_from_slice(b"o\r\n0\r\n\r\n");
        match decoder.decode(&mut buf).unwrap() {
            Some(Decoded::Data(b)) => assert_eq!(&b[..], b"o"),
            other => panic!("expected remaining chunk byte, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn chunked_rejects_bad_size() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }
}
