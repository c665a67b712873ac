//! Buffered transport wrapper: accumulates read bytes for the sans-io
//! parser/decoder and applies write-side backpressure through the
//! connection's [`FlowControl`](crate::flow::FlowControl).

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::flow::FlowControl;

/// Write buffer is flushed once it grows past this many bytes, closing the
/// flow-control gate until the write completes.
const WRITE_HIGH_WATER: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub(crate) struct Buffered<T> {
    io: T,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    flow: FlowControl,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Buffered<T> {
    pub(crate) fn new(io: T, flow: FlowControl) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            flow,
        }
    }

    /// Reads more bytes from the transport into `read_buf`.
    ///
    /// Returns `Ok(0)` on EOF, matching `AsyncRead::poll_read` convention.
    pub(crate) async fn read_more(&mut self) -> std::io::Result<usize> {
        self.read_buf.reserve(READ_CHUNK);
        let dst = self.read_buf.spare_capacity_mut();
        let mut read_buf = ReadBuf::uninit(dst);
        std::future::poll_fn(|cx| std::pin::Pin::new(&mut self.io).poll_read(cx, &mut read_buf))
            .await?;
        let n = read_buf.filled().len();
        // Safety: `poll_read` only reports `n` bytes filled when it actually
        // initialized them, satisfying `set_len`'s requirement.
        unsafe {
            self.read_buf.set_len(self.read_buf.len() + n);
        }
        Ok(n)
    }

    /// Appends to the write buffer, honoring the high-water mark.
    pub(crate) fn buffer(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
        if self.write_buf.len() >= WRITE_HIGH_WATER {
            self.flow.pause_writing();
        }
    }

    /// Flushes whatever is pending in the write buffer to the transport,
    /// reopening the flow-control gate once drained.
    pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
        while !self.write_buf.is_empty() {
            let n = self.io.write(&self.write_buf).await?;
            self.write_buf.advance(n);
        }
        self.io.flush().await?;
        self.flow.resume_writing();
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }

    /// Tears down buffering to hand the raw transport to an upgrade
    /// handler. Any bytes already read past the request head are returned
    /// alongside so the caller can replay them.
    pub(crate) fn into_parts(self) -> (T, BytesMut) {
        (self.io, self.read_buf)
    }
}
