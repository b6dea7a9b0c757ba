//! Forward proxy front-ends
//!
//! One listener serves both proxy protocols: SOCKS5 greetings start with
//! the version byte `0x05`, everything else is treated as HTTP. Each
//! accepted connection is sniffed, handed to the matching handler and
//! routed through the rule table, falling back to a local direct dialer
//! for targets no tunnel claims.

mod forward;
mod http;
mod socks5;

pub use forward::TcpForwarder;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::common::{PrependStream, Stream};
use crate::dialer::{Dialer, DirectDialer};
use crate::error::Result;
use crate::router::RuleTable;

const SOCKS5_VERSION: u8 = 0x05;

pub struct ProxyServer {
    rules: RuleTable,
    local: Arc<dyn Dialer>,
}

impl ProxyServer {
    pub fn new(rules: RuleTable, timeout: Duration) -> Self {
        Self {
            rules,
            local: Arc::new(DirectDialer::new(timeout)),
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("listening on {}", listener.local_addr()?);

        loop {
            let (socket, peer) = listener.accept().await?;
            socket.set_nodelay(true).ok();

            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(Box::new(socket)).await {
                    debug!("proxy connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: Stream) -> Result<()> {
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).await?;
        let stream: Stream = Box::new(PrependStream::new(BytesMut::from(&first[..]), stream));

        if first[0] == SOCKS5_VERSION {
            socks5::handle(self, stream).await
        } else {
            http::handle(self, stream).await
        }
    }

    /// Dial `addr` through the rule table, logging the chosen mode.
    pub(crate) async fn dial(&self, network: &str, addr: &str) -> Result<Stream> {
        let (mode, dialer) = self.rules.route(addr, &self.local);

        match dialer.dial(network, addr).await {
            Ok(stream) => {
                info!("dialed upstream {} mode={}", addr, mode);
                Ok(stream)
            }
            Err(e) => {
                error!("error dialing upstream {}: {}", addr, e);
                Err(e)
            }
        }
    }
}
