//! Local TCP forwarder
//!
//! Listens on a local address and forwards every accepted connection to a
//! fixed upstream through the configured dialer chain.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::common::{relay, Stream};
use crate::dialer::Dialer;
use crate::error::Result;

pub struct TcpForwarder {
    upstream: String,
    dialer: Arc<dyn Dialer>,
}

impl TcpForwarder {
    pub fn new(upstream: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            upstream: upstream.into(),
            dialer,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);

        loop {
            let (socket, peer) = listener.accept().await?;
            socket.set_nodelay(true).ok();

            let forwarder = self.clone();
            tokio::spawn(async move {
                forwarder.handle_connection(Box::new(socket), peer).await;
            });
        }
    }

    async fn handle_connection(&self, stream: Stream, peer: SocketAddr) {
        let upstream = match self.dialer.dial("tcp", &self.upstream).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("unable to dial upstream {}: {}", self.upstream, e);
                return;
            }
        };

        info!("forwarding {} -> {}", peer, self.upstream);
        relay(stream, upstream).await;
    }
}
