//! Stream multiplexing over a single transport.
//!
//! One physical connection (TCP, TLS, or an IAP tunnel) carries many
//! logical tunnel streams. HTTP/2 provides the session layer: a client
//! session opens one h2 stream per logical connection, the server answers
//! each with a `200` and from then on both sides treat the stream as an
//! opaque byte pipe.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::{IntoStream, Stream};
use crate::error::{Error, Result};

/// Client side of a multiplexed transport.
///
/// Cheap to clone; all clones share the underlying connection. The session
/// reports closed once the connection driver has exited, after which every
/// `open_stream` fails and the caller is expected to dial a new session.
#[derive(Clone)]
pub struct MuxSession {
    send_request: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    /// Establish a client session over `stream` and spawn its driver task.
    pub async fn connect(stream: Stream) -> Result<Self> {
        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| Error::Transport(format!("mux handshake failed: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("mux connection terminated: {}", e);
            }
            flag.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            send_request,
            closed,
        })
    }

    /// Whether the underlying transport is still open.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open a new logical stream inside the session.
    pub async fn open_stream(&self) -> Result<Stream> {
        let mut ready = self
            .send_request
            .clone()
            .ready()
            .await
            .map_err(|e| Error::Transport(format!("mux session not ready: {}", e)))?;

        let request = Request::builder()
            .method("POST")
            .uri("http://tunnel/stream")
            .body(())
            .map_err(|e| Error::Protocol(format!("failed to build stream request: {}", e)))?;

        let (response, send) = ready
            .send_request(request, false)
            .map_err(|e| Error::Transport(format!("failed to open mux stream: {}", e)))?;

        let response = response
            .await
            .map_err(|e| Error::Transport(format!("mux stream rejected: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "mux stream rejected: {}",
                response.status()
            )));
        }

        let recv = response.into_body();
        Ok(MuxStream::new(send, recv).into_stream())
    }
}

/// Serve the server side of a multiplexed transport.
///
/// Every stream the peer opens is answered with `200` and handed to
/// `handler` as a plain byte stream, each in its own task. Returns when the
/// peer goes away.
pub async fn serve_session<F, Fut>(stream: Stream, handler: F) -> Result<()>
where
    F: Fn(Stream) -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut connection = h2::server::handshake(stream)
        .await
        .map_err(|e| Error::Transport(format!("mux handshake failed: {}", e)))?;

    while let Some(accepted) = connection.accept().await {
        let (request, mut respond) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!("mux accept failed: {}", e);
                break;
            }
        };
        let recv = request.into_body();

        let response = Response::builder()
            .status(200)
            .body(())
            .map_err(|e| Error::Protocol(format!("failed to build stream response: {}", e)))?;
        let send = match respond.send_response(response, false) {
            Ok(send) => send,
            Err(e) => {
                debug!("mux stream response failed: {}", e);
                continue;
            }
        };

        tokio::spawn(handler(MuxStream::new(send, recv).into_stream()));
    }

    Ok(())
}

/// One logical stream inside a session, as a byte stream.
struct MuxStream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    read_buf: Bytes,
    finished: bool,
}

impl MuxStream {
    fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            read_buf: Bytes::new(),
            finished: false,
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buf.is_empty() {
            let n = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }

        loop {
            return match this.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    if data.is_empty() {
                        // Empty DATA frames carry no payload; keep polling.
                        continue;
                    }
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        this.read_buf = data.slice(n..);
                    }
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    e.to_string(),
                ))),
                Poll::Ready(None) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mux stream closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.send.reserve_capacity(buf.len());
        loop {
            return match this.send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(0))) => continue,
                Poll::Ready(Some(Ok(available))) => {
                    let n = available.min(buf.len());
                    this.send
                        .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                        .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
                    Poll::Ready(Ok(n))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    e.to_string(),
                ))),
                Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "mux stream closed",
                ))),
                Poll::Pending => Poll::Pending,
            };
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The connection driver flushes frames as they are produced.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.finished {
            this.finished = true;
            let _ = this.send.send_data(Bytes::new(), true);
        }
        Poll::Ready(Ok(()))
    }
}
