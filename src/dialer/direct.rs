//! Direct TCP dialer

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::Dialer;
use crate::common::Stream;
use crate::error::{Error, Result};

/// Connect timeout used when none is configured.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain TCP dialer with a connect timeout.
pub struct DirectDialer {
    timeout: Duration,
}

impl DirectDialer {
    /// A zero timeout selects [`DEFAULT_DIAL_TIMEOUT`].
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            timeout
        };
        Self { timeout }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<Stream> {
        if network != "tcp" {
            return Err(Error::Transport(format!(
                "unsupported network '{}'",
                network
            )));
        }

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}
