//! Relay connection: establishment, reader task, byte-stream adapter.
//!
//! The relay never presents raw bytes; everything is framed. An
//! [`IapTunnel`] hides that behind the ordinary stream interface:
//!
//! - a reader task parses incoming frames and appends Data payloads to an
//!   in-memory pipe, emitting Ack frames as the unacknowledged count grows;
//! - a writer task owns the transport write half and serializes outgoing
//!   frames (Data from callers, Ack from the reader) one message each;
//! - the public surface reads from the pipe and enqueues Data frames.
//!
//! Teardown is triangular: closing the tunnel cancels both tasks, the
//! reader drops the pipe writer, and consumers drain to EOF.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, SimplexStream,
    WriteHalf,
};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use super::frame::{encode_ack, encode_data, MAX_FRAME_LEN, TAG_ACK, TAG_DATA, TAG_SUCCESS};
use crate::common::Stream;
use crate::error::{Error, Result};

/// Emit an Ack once the unacknowledged count exceeds two full frames.
const ACK_THRESHOLD: u64 = 2 * MAX_FRAME_LEN as u64;

/// Capacity of the in-memory receive pipe.
const RECV_PIPE_CAPACITY: usize = 4 * MAX_FRAME_LEN;

/// Outbound frame queue depth, in frames.
const SEND_QUEUE_FRAMES: usize = 8;

struct Shared {
    closed: AtomicBool,
    cancel: CancellationToken,
    /// Bytes we have put on the wire, including frame headers.
    send_unacked: AtomicU64,
    /// Bytes the relay has acknowledged. Written only by the reader task;
    /// stale reads elsewhere are fine.
    send_acked: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            send_unacked: AtomicU64::new(0),
            send_acked: AtomicU64::new(0),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// An established relay connection, usable as a plain byte stream.
///
/// Reads observe Data payloads in arrival order; writes are chunked into
/// Data frames of at most 16 KiB. Closing is idempotent and may be invoked
/// from multiple teardown paths.
pub struct IapTunnel {
    recv: ReadHalf<SimplexStream>,
    out: PollSender<Bytes>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for IapTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IapTunnel").finish()
    }
}

impl IapTunnel {
    /// Run the establishment handshake on a freshly upgraded transport.
    ///
    /// The first frame on the wire must be Success; anything else fails the
    /// dial. On success the reader and writer tasks are spawned and the
    /// tunnel is ready to carry bytes.
    pub(crate) async fn establish(stream: Stream) -> Result<IapTunnel> {
        let (mut transport_rd, transport_wr) = tokio::io::split(stream);

        let tag = read_u16(&mut transport_rd)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if tag != TAG_SUCCESS {
            return Err(Error::Protocol(
                "received frame before connection was established".to_string(),
            ));
        }

        let mut staging = vec![0u8; MAX_FRAME_LEN];
        read_body(&mut transport_rd, &mut staging)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => Error::Protocol(e.to_string()),
                _ => Error::Transport(e.to_string()),
            })?;
        trace!("relay session established");

        let (pipe_rd, pipe_wr) = tokio::io::simplex(RECV_PIPE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_FRAMES);
        let shared = Arc::new(Shared::new());

        tokio::spawn(run_reader(
            transport_rd,
            pipe_wr,
            out_tx.clone(),
            shared.clone(),
        ));
        tokio::spawn(run_writer(transport_wr, out_rx, shared.clone()));

        Ok(IapTunnel {
            recv: pipe_rd,
            out: PollSender::new(out_tx),
            shared,
        })
    }

    /// Close the tunnel. Safe to call more than once; only the first call
    /// has any effect.
    pub fn close(&mut self) {
        self.out.close();
        self.shared.close();
    }
}

impl Drop for IapTunnel {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl AsyncRead for IapTunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for IapTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shared.is_closed() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let chunk = &buf[..buf.len().min(MAX_FRAME_LEN)];
                let frame = encode_data(chunk);
                this.shared
                    .send_unacked
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                if this.out.send_item(frame).is_err() {
                    return Poll::Ready(Err(broken_pipe()));
                }
                Poll::Ready(Ok(chunk.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the writer task as they are dequeued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "relay connection closed")
}

/// Parse frames until the transport fails or the tunnel is closed.
async fn run_reader(
    mut transport: ReadHalf<Stream>,
    mut pipe: WriteHalf<SimplexStream>,
    acks: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
) {
    let mut staging = vec![0u8; MAX_FRAME_LEN];
    let mut recv_acked: u64 = 0;
    let mut recv_unacked: u64 = 0;

    loop {
        let step = process_frame(
            &mut transport,
            &mut pipe,
            &acks,
            &shared,
            &mut staging,
            &mut recv_acked,
            &mut recv_unacked,
        );

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = step => match result {
                Ok(()) => {}
                Err(e) => {
                    trace!("relay reader stopped: {}", e);
                    break;
                }
            },
        }
    }

    shared.close();
    // Dropping the pipe writer delivers EOF to consumers once the buffered
    // bytes drain.
}

async fn process_frame(
    transport: &mut ReadHalf<Stream>,
    pipe: &mut WriteHalf<SimplexStream>,
    acks: &mpsc::Sender<Bytes>,
    shared: &Shared,
    staging: &mut [u8],
    recv_acked: &mut u64,
    recv_unacked: &mut u64,
) -> io::Result<()> {
    let tag = read_u16(transport).await?;

    match tag {
        TAG_DATA => {
            let len = read_body(transport, staging).await?;
            pipe.write_all(&staging[..len]).await?;
            *recv_unacked += len as u64;

            if *recv_unacked - *recv_acked > ACK_THRESHOLD {
                acks.send(encode_ack(*recv_unacked))
                    .await
                    .map_err(|_| broken_pipe())?;
                *recv_acked = *recv_unacked;
            }
        }
        TAG_ACK => {
            let acked = read_u64(transport).await?;
            shared.send_acked.store(acked, Ordering::Relaxed);
        }
        TAG_SUCCESS => {
            // A stray Success after establishment still carries a session id
            // body; consume it and move on.
            let len = read_body(transport, staging).await?;
            debug!("ignoring late success frame ({} byte session id)", len);
        }
        other => {
            trace!("ignoring unknown relay frame tag {:#06x}", other);
        }
    }

    Ok(())
}

/// Drain outgoing frames to the transport, one write per frame.
async fn run_writer(
    mut transport: WriteHalf<Stream>,
    mut queue: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if transport.write_all(&frame).await.is_err() {
            break;
        }
        if transport.flush().await.is_err() {
            break;
        }
    }

    shared.close();
}

/// Read a u32 length and that many body bytes into `staging`.
async fn read_body(transport: &mut ReadHalf<Stream>, staging: &mut [u8]) -> io::Result<usize> {
    let len = read_u32(transport).await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "len exceeds subprotocol max data frame size",
        ));
    }
    transport.read_exact(&mut staging[..len]).await?;
    Ok(len)
}

async fn read_u16(transport: &mut ReadHalf<Stream>) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    transport.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

async fn read_u32(transport: &mut ReadHalf<Stream>) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    transport.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

async fn read_u64(transport: &mut ReadHalf<Stream>) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    transport.read_exact(&mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iap::frame::encode_success;
    use bytes::{BufMut, BytesMut};
    use tokio::io::DuplexStream;

    async fn establish_pair() -> (IapTunnel, DuplexStream) {
        let (local, mut peer) = tokio::io::duplex(256 * 1024);

        peer.write_all(&encode_success(b"session-1")).await.unwrap();

        let tunnel = IapTunnel::establish(Box::new(local)).await.unwrap();
        (tunnel, peer)
    }

    #[tokio::test]
    async fn test_data_frames_read_in_order() {
        let (mut tunnel, mut peer) = establish_pair().await;

        peer.write_all(&encode_data(b"abc")).await.unwrap();
        peer.write_all(&encode_data(b"de")).await.unwrap();

        let mut buf = vec![0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcde");
    }

    #[tokio::test]
    async fn test_frame_before_success_fails_dial() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);

        peer.write_all(&encode_data(b"abc")).await.unwrap();

        let err = IapTunnel::establish(Box::new(local)).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_transport_close_fails_dial() {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        drop(peer);

        let err = IapTunnel::establish(Box::new(local)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_ack_emitted_after_threshold() {
        let (mut tunnel, mut peer) = establish_pair().await;

        // Three full frames push the unacknowledged count past 2 * 16384.
        let payload = vec![0x55u8; MAX_FRAME_LEN];
        for _ in 0..3 {
            peer.write_all(&encode_data(&payload)).await.unwrap();
        }

        let mut ack = [0u8; 10];
        peer.read_exact(&mut ack).await.unwrap();
        assert_eq!(u16::from_be_bytes([ack[0], ack[1]]), TAG_ACK);
        let acked = u64::from_be_bytes(ack[2..10].try_into().unwrap());
        assert_eq!(acked, 3 * MAX_FRAME_LEN as u64);

        let mut buf = vec![0u8; 3 * MAX_FRAME_LEN];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0x55));
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_connection() {
        let (mut tunnel, mut peer) = establish_pair().await;

        let mut frame = BytesMut::new();
        frame.put_u16(TAG_DATA);
        frame.put_u32(MAX_FRAME_LEN as u32 + 1);
        peer.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tunnel.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected EOF after protocol violation");
    }

    #[tokio::test]
    async fn test_unknown_tag_ignored_after_establishment() {
        let (mut tunnel, mut peer) = establish_pair().await;

        peer.write_all(&[0x00, 0x09]).await.unwrap();
        peer.write_all(&encode_data(b"hi")).await.unwrap();

        let mut buf = [0u8; 2];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_ack_frame_updates_send_accounting() {
        let (mut tunnel, mut peer) = establish_pair().await;

        tunnel.write_all(b"ping").await.unwrap();

        let mut frame = [0u8; 10];
        peer.read_exact(&mut frame).await.unwrap();
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), TAG_DATA);

        peer.write_all(&encode_ack(10)).await.unwrap();

        // The reader applies the ack asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(tunnel.shared.send_acked.load(Ordering::Relaxed), 10);
        assert_eq!(tunnel.shared.send_unacked.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_write_chunks_at_frame_boundary() {
        let (mut tunnel, mut peer) = establish_pair().await;

        // Exactly one frame...
        tunnel.write_all(&vec![1u8; MAX_FRAME_LEN]).await.unwrap();
        let mut header = [0u8; 6];
        peer.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
        assert_eq!(len, MAX_FRAME_LEN);
        let mut body = vec![0u8; len];
        peer.read_exact(&mut body).await.unwrap();

        // ...and one byte more makes two.
        tunnel
            .write_all(&vec![2u8; MAX_FRAME_LEN + 1])
            .await
            .unwrap();
        peer.read_exact(&mut header).await.unwrap();
        let first = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
        assert_eq!(first, MAX_FRAME_LEN);
        let mut body = vec![0u8; first];
        peer.read_exact(&mut body).await.unwrap();

        peer.read_exact(&mut header).await.unwrap();
        let second = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
        assert_eq!(second, 1);
        let mut body = vec![0u8; second];
        peer.read_exact(&mut body).await.unwrap();
        assert_eq!(body, vec![2u8]);
    }

    #[tokio::test]
    async fn test_loopback_echo_round_trip() {
        let (mut tunnel, mut peer) = establish_pair().await;

        // Peer parses Data frames and echoes the payloads back as Data.
        tokio::spawn(async move {
            loop {
                let mut header = [0u8; 6];
                if peer.read_exact(&mut header).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
                let mut payload = vec![0u8; len];
                if peer.read_exact(&mut payload).await.is_err() {
                    break;
                }
                if peer.write_all(&encode_data(&payload)).await.is_err() {
                    break;
                }
            }
        });

        let sent: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut received = vec![0u8; sent.len()];

        let (mut tunnel_rd, mut tunnel_wr) = tokio::io::split(tunnel);
        let (write_result, read_result) = tokio::join!(
            async {
                for chunk in sent.chunks(7919) {
                    tunnel_wr.write_all(chunk).await?;
                }
                Ok::<_, io::Error>(())
            },
            async {
                // Reading concurrently keeps the receive pipe drained.
                let mut filled = 0;
                while filled < received.len() {
                    let n = tunnel_rd.read(&mut received[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok::<_, io::Error>(filled)
            }
        );
        write_result.unwrap();
        assert_eq!(read_result.unwrap(), sent.len());
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut tunnel, _peer) = establish_pair().await;

        tunnel.close();
        tunnel.close();
        tunnel.shutdown().await.unwrap();

        let err = tunnel.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
