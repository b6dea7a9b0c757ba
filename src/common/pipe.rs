//! Bidirectional relay between two byte streams.
//!
//! `relay` joins two streams and copies in both directions until either
//! direction sees EOF or an error, then tears down both sides. Errors are
//! not surfaced here; the callers have already logged the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Stream;

/// Buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy bytes between `a` and `b` in both directions.
///
/// Returns once the first direction finishes; the other copy is cancelled
/// and both streams are shut down and dropped. The return value is the
/// number of bytes copied a->b and b->a, for logging.
pub async fn relay(a: Stream, b: Stream) -> (u64, u64) {
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut up: u64 = 0;
    let mut down: u64 = 0;

    {
        let upload = copy_oneway(&mut a_read, &mut b_write, &mut up);
        let download = copy_oneway(&mut b_read, &mut a_write, &mut down);

        tokio::pin!(upload, download);
        tokio::select! {
            _ = &mut upload => {}
            _ = &mut download => {}
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    (up, down)
}

async fn copy_oneway<R, W>(reader: &mut R, writer: &mut W, total: &mut u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        // Flush to ensure data is sent immediately
        if writer.flush().await.is_err() {
            break;
        }

        *total += n as u64;
    }
}
