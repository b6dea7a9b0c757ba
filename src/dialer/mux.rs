//! Session-caching dialer decorator.
//!
//! Keeps at most one live mux session per `(network, address)` and opens a
//! logical stream on it for every dial. A session that lost its transport
//! is replaced on the next dial; entries are never evicted explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::Dialer;
use crate::common::Stream;
use crate::error::Result;
use crate::mux::MuxSession;

pub struct MuxedDialer {
    inner: Arc<dyn Dialer>,
    sessions: RwLock<HashMap<String, MuxSession>>,
}

impl MuxedDialer {
    pub fn new(inner: Arc<dyn Dialer>) -> Self {
        Self {
            inner,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn session(&self, network: &str, addr: &str) -> Result<MuxSession> {
        let key = format!("{}|{}", network, addr);

        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&key) {
                if !session.is_closed() {
                    return Ok(session.clone());
                }
            }
        }

        // First dial, or the cached session lost its transport. The write
        // guard is held across the dial so concurrent callers share the one
        // connection being built instead of racing their own.
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }

        debug!("dialing mux transport for {}", key);
        let transport = self.inner.dial(network, addr).await?;
        let session = MuxSession::connect(transport).await?;
        sessions.insert(key, session.clone());

        Ok(session)
    }
}

#[async_trait]
impl Dialer for MuxedDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<Stream> {
        let session = self.session(network, addr).await?;
        session.open_stream().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::serve_session;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Inner dialer handing out in-memory transports to an echo mux server,
    /// counting how many transports were actually dialed.
    struct CountingDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _network: &str, _addr: &str) -> Result<Stream> {
            self.dials.fetch_add(1, Ordering::SeqCst);

            let (local, peer) = tokio::io::duplex(256 * 1024);
            tokio::spawn(async move {
                let _ = serve_session(Box::new(peer), |mut stream| async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                })
                .await;
            });

            Ok(Box::new(local))
        }
    }

    #[tokio::test]
    async fn test_one_transport_per_destination() {
        let inner = Arc::new(CountingDialer {
            dials: AtomicUsize::new(0),
        });
        let dialer = MuxedDialer::new(inner.clone());

        let mut first = dialer.dial("tcp", "10.0.0.1:80").await.unwrap();
        let mut second = dialer.dial("tcp", "10.0.0.1:80").await.unwrap();
        assert_eq!(inner.dials.load(Ordering::SeqCst), 1);

        first.write_all(b"a").await.unwrap();
        second.write_all(b"b").await.unwrap();

        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a");
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");
    }

    #[tokio::test]
    async fn test_distinct_destinations_get_distinct_transports() {
        let inner = Arc::new(CountingDialer {
            dials: AtomicUsize::new(0),
        });
        let dialer = MuxedDialer::new(inner.clone());

        dialer.dial("tcp", "10.0.0.1:80").await.unwrap();
        dialer.dial("tcp", "10.0.0.2:80").await.unwrap();
        assert_eq!(inner.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_dials_share_one_transport() {
        let inner = Arc::new(CountingDialer {
            dials: AtomicUsize::new(0),
        });
        let dialer = Arc::new(MuxedDialer::new(inner.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dialer = dialer.clone();
            handles.push(tokio::spawn(async move {
                dialer.dial("tcp", "10.0.0.1:80").await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(inner.dials.load(Ordering::SeqCst), 1);
    }
}
