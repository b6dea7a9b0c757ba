//! Upgrade-over-HTTP tunnel server
//!
//! Accepts tunnel requests, checks the requested upstream against the
//! allow-list, dials it and joins the two byte streams. Two connection
//! flavors share one port: plain HTTP/1.1, and multiplexed sessions whose
//! logical streams each carry one HTTP/1.1 tunnel request. The flavor is
//! sniffed from the first bytes of the connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::common::{relay, PrependStream, Stream};
use crate::dialer::{Dialer, DirectDialer};
use crate::error::{Error, Result};
use crate::mux;
use crate::router::{RuleTable, UpstreamRule};

/// Default port of the tunnel server.
pub const DEFAULT_PORT: u16 = 7654;

/// First bytes of a multiplexed session; everything else is HTTP/1.1.
const MUX_PREFACE: &[u8; 3] = b"PRI";

pub struct TunnelServer {
    rules: RuleTable,
}

impl TunnelServer {
    /// Build a server dialing upstreams directly with `timeout`. An empty
    /// allow-list permits every upstream.
    pub fn new(timeout: Duration, allowed_upstreams: &[String]) -> Self {
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer::new(timeout));

        let patterns: Vec<String> = if allowed_upstreams.is_empty() {
            vec!["*".to_string()]
        } else {
            allowed_upstreams.to_vec()
        };

        let rules = RuleTable::new(
            patterns
                .into_iter()
                .map(|pattern| UpstreamRule::new(pattern, dialer.clone()))
                .collect(),
        );

        Self { rules }
    }

    /// Accept loop. Each connection runs in its own task; connection errors
    /// are logged and never stop the listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        // Behind Cloud Run the fronting infrastructure already multiplexes
        // requests onto the container, so only plain HTTP is served there.
        // See https://cloud.google.com/run/docs/container-contract#env-vars
        let sniff_mux = std::env::var("K_SERVICE").is_err();

        let addr = listener.local_addr()?;
        if sniff_mux {
            info!("listening on {} in mux mode", addr);
        } else {
            info!("listening on {} in standard mode", addr);
        }

        loop {
            let (socket, peer) = listener.accept().await?;
            socket.set_nodelay(true).ok();

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(Box::new(socket), sniff_mux).await {
                    debug!("connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: Stream, sniff_mux: bool) -> Result<()> {
        if !sniff_mux {
            return self.serve_tunnel_request(stream).await;
        }

        let mut head = [0u8; 3];
        stream.read_exact(&mut head).await?;
        let stream: Stream = Box::new(PrependStream::new(BytesMut::from(&head[..]), stream));

        if &head == MUX_PREFACE {
            let server = self.clone();
            mux::serve_session(stream, move |sub| {
                let server = server.clone();
                async move {
                    if let Err(e) = server.serve_tunnel_request(sub).await {
                        debug!("mux stream failed: {}", e);
                    }
                }
            })
            .await
        } else {
            self.serve_tunnel_request(stream).await
        }
    }

    /// Serve one HTTP/1.1 tunnel request on `stream`.
    async fn serve_tunnel_request(&self, stream: Stream) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let (_method, _target, headers) = parse_request_head(&mut reader).await?;

        let Some(target) = header_value(&headers, "x-cloud-tunnel-upstream") else {
            write_error(&mut reader, 400, "Bad Request", "missing target header").await?;
            return Ok(());
        };
        let target = target.to_string();

        match header_value(&headers, "upgrade") {
            Some(proto) if proto.eq_ignore_ascii_case("websocket") => {}
            Some(_) => {
                write_error(&mut reader, 400, "Bad Request", "unknown next protocol").await?;
                return Ok(());
            }
            None => {
                write_error(&mut reader, 400, "Bad Request", "missing next protocol").await?;
                return Ok(());
            }
        }

        let Some(rule) = self.rules.find(&target) else {
            write_error(&mut reader, 403, "Forbidden", "upstream not allowed").await?;
            return Ok(());
        };

        let upstream = match rule.dialer().dial("tcp", &target).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("unable to dial upstream {}: {}", target, e);
                write_error(&mut reader, 503, "Service Unavailable", "upstream unreachable")
                    .await?;
                return Ok(());
            }
        };
        info!("dialed upstream {}", target);

        reader
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: upgrade\r\n\r\n",
            )
            .await?;
        reader.flush().await?;

        // From here the connection carries raw tunnel bytes.
        relay(Box::new(reader), upstream).await;
        Ok(())
    }
}

/// Parse the request line and headers of an HTTP/1.1 request. Header names
/// are lowercased.
async fn parse_request_head<R>(reader: &mut R) -> Result<(String, String, Vec<(String, String)>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol(format!(
            "invalid request line: {}",
            line.trim()
        )));
    };
    let method = method.to_string();
    let target = target.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Protocol(
                "connection closed inside request headers".to_string(),
            ));
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    Ok((method, target, headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

async fn write_error<W>(writer: &mut W, status: u16, reason: &str, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}\n",
        status,
        reason,
        body.len() + 1,
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(server: TunnelServer, request: &str) -> String {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);

        let server = Arc::new(server);
        peer.write_all(request.as_bytes()).await.unwrap();

        let handle = tokio::spawn(async move {
            let _ = server.serve_tunnel_request(Box::new(local)).await;
        });

        let mut response = Vec::new();
        peer.read_to_end(&mut response).await.unwrap();
        handle.await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn test_missing_target_header_is_rejected() {
        let server = TunnelServer::new(Duration::ZERO, &[]);
        let response = roundtrip(
            server,
            "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: upgrade\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
    }

    #[tokio::test]
    async fn test_missing_upgrade_header_is_rejected() {
        let server = TunnelServer::new(Duration::ZERO, &[]);
        let response = roundtrip(
            server,
            "GET / HTTP/1.1\r\nX-Cloud-Tunnel-Upstream: 127.0.0.1:9\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
    }

    #[tokio::test]
    async fn test_disallowed_upstream_is_rejected() {
        let server = TunnelServer::new(Duration::ZERO, &["10.0.0.0/8".to_string()]);
        let response = roundtrip(
            server,
            "GET / HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: upgrade\r\n\
             X-Cloud-Tunnel-Upstream: 192.168.0.1:22\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 403"), "got: {}", response);
    }

    #[tokio::test]
    async fn test_parse_request_head() {
        let raw: &[u8] = b"GET /tunnel HTTP/1.1\r\nHost: example.com\r\nUpgrade: WebSocket\r\n\r\n";
        let mut reader = BufReader::new(raw);

        let (method, target, headers) = parse_request_head(&mut reader).await.unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "/tunnel");
        assert_eq!(header_value(&headers, "host"), Some("example.com"));
        assert_eq!(header_value(&headers, "upgrade"), Some("WebSocket"));
    }
}
