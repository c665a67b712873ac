//! Response body encoder: appends framed body bytes directly to the
//! connection's write buffer.
//!
//! The teacher's encoder produces zero-copy `Buf` chains for a vectored
//! writer; this server writes into one contiguous `BytesMut` per flush
//! instead; so it encodes by appending, not by composing buffer chains.

use bytes::{BufMut, BytesMut};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    Chunked,
    Length(u64),
    CloseDelimited,
}

impl Encoder {
    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked)
    }

    /// Encode one body chunk into `dst`. No-op for an empty `msg`.
    pub(crate) fn encode(&mut self, msg: &[u8], dst: &mut BytesMut) {
        if msg.is_empty() {
            return;
        }
        match self.kind {
            Kind::Chunked => {
                dst.extend_from_slice(format!("{:x}\r\n", msg.len()).as_bytes());
                dst.extend_from_slice(msg);
                dst.extend_from_slice(b"\r\n");
            }
            Kind::Length(ref mut remaining) => {
                let len = std::cmp::min(*remaining, msg.len() as u64) as usize;
                dst.extend_from_slice(&msg[..len]);
                *remaining -= len as u64;
            }
            Kind::CloseDelimited => dst.extend_from_slice(msg),
        }
    }

    /// Encode the terminator for this encoding (`0\r\n\r\n` for chunked;
    /// nothing otherwise).
    pub(crate) fn encode_end(&self, dst: &mut BytesMut) {
        if let Kind::Chunked = self.kind {
            dst.put_slice(b"0\r\n\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_frames_each_write() {
        let mut encoder = Encoder::chunked();
        let mut dst = BytesMut::new();
        encoder.encode(b"foo bar", &mut dst);
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\n");
        encoder.encode(b"baz quux herp", &mut dst);
        encoder.encode_end(&mut dst);
        assert_eq!(
            &dst[..],
            b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n0\r\n\r\n".as_ref()
        );
    }

    #[test]
    fn length_truncates_overflow() {
        let mut encoder = Encoder::length(8);
        let mut dst = BytesMut::new();
        encoder.encode(b"foo bar", &mut dst);
        encoder.encode(b"baz", &mut dst);
        assert_eq!(&dst[..], b"foo barb");
    }

    #[test]
    fn close_delimited_passes_through() {
        let mut encoder = Encoder::close_delimited();
        let mut dst = BytesMut::new();
        encoder.encode(b"foo bar", &mut dst);
        assert_eq!(&dst[..], b"foo bar");
    }
}
