//! Stream abstraction
//!
//! Unified stream type for all layers to operate on.
//! All layers ONLY operate on Stream, never on raw sockets.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The core stream type used throughout the application.
/// All layers operate on this unified abstraction.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

impl std::fmt::Debug for dyn AsyncReadWrite + Unpin + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Stream")
    }
}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

/// Stream wrapper that replays already-consumed bytes before the
/// underlying stream.
///
/// Used wherever a listener has to sniff the first bytes of a connection
/// (SOCKS5 vs HTTP, HTTP/2 preface) before deciding how to serve it.
pub struct PrependStream {
    prepend: BytesMut,
    inner: Stream,
}

impl PrependStream {
    pub fn new(prepend: BytesMut, inner: Stream) -> Self {
        Self { prepend, inner }
    }
}

impl AsyncRead for PrependStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // First drain prepended data
        if !self.prepend.is_empty() {
            let to_copy = self.prepend.len().min(buf.remaining());
            buf.put_slice(&self.prepend[..to_copy]);
            let _ = self.prepend.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        // Then read from inner stream
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrependStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
