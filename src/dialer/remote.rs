//! Upgrade-over-HTTP tunnel client.
//!
//! The tunnel server is an ordinary HTTP endpoint. A client asks for a
//! tunnel with a `GET` carrying `Upgrade: websocket` and a header naming
//! the upstream it wants; a `101 Switching Protocols` answer means the
//! connection now carries the upstream's bytes directly. Only the upgrade
//! syntax is borrowed from WebSockets; no message framing follows. Cloud
//! HTTP load balancers honor the upgrade and pass raw bytes through.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::Dialer;
use crate::auth::TokenProvider;
use crate::common::Stream;
use crate::error::{Error, Result};

/// Header naming the upstream a tunnel should reach.
pub const UPSTREAM_HEADER: &str = "X-Cloud-Tunnel-Upstream";

/// Dialer that opens tunnels through an upgrade-over-HTTP tunnel server.
///
/// The transport carrying the HTTP exchange is itself a dialer, so a tunnel
/// server can be reached over plain TCP, TLS, the IAP relay, or a
/// multiplexed session over any of those.
pub struct RemoteDialer {
    url: ServiceUrl,
    tokens: Option<Arc<dyn TokenProvider>>,
    transport: Arc<dyn Dialer>,
    tls: Option<TlsConnector>,
}

impl RemoteDialer {
    pub fn new(
        service_url: &str,
        tokens: Option<Arc<dyn TokenProvider>>,
        transport: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let url = ServiceUrl::parse(service_url)?;
        let tls = url.https.then(tls_connector);

        Ok(Self {
            url,
            tokens,
            transport,
            tls,
        })
    }
}

#[async_trait]
impl Dialer for RemoteDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<Stream> {
        if network != "tcp" {
            return Err(Error::Transport(format!(
                "unsupported network '{}'",
                network
            )));
        }

        let stream = self.transport.dial("tcp", &self.url.authority()).await?;

        let mut stream = match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(self.url.host.clone())
                    .map_err(|_| Error::Config(format!("invalid server name: {}", self.url.host)))?;
                Box::new(connector.connect(server_name, stream).await?) as Stream
            }
            None => stream,
        };

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: upgrade\r\n{}: {}\r\n",
            self.url.path,
            self.url.authority(),
            UPSTREAM_HEADER,
            addr,
        );
        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await?;
            request.push_str(&format!("Authorization: Bearer {}\r\n", token.access_token));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;

        if parse_status_code(&status_line)? != 101 {
            return Err(Error::Transport(format!(
                "invalid response: {}",
                status_line.trim()
            )));
        }
        skip_headers(&mut reader).await?;

        // The HTTP exchange is over; the buffered connection is the tunnel.
        Ok(Box::new(reader))
    }
}

/// The pieces of a tunnel service URL this client needs.
struct ServiceUrl {
    https: bool,
    host: String,
    port: u16,
    path: String,
}

impl ServiceUrl {
    fn parse(url: &str) -> Result<Self> {
        let (https, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(Error::Config(format!("unsupported service url: {}", url)));
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Error::Config(format!("missing host in service url: {}", url)));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port in service url: {}", url)))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), if https { 443 } else { 80 }),
        };

        Ok(Self {
            https,
            host,
            port,
            path: path.to_string(),
        })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

fn parse_status_code(line: &str) -> Result<u16> {
    let mut parts = line.trim().split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| Error::Protocol("empty response line".to_string()))?;
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid response line: {}", line.trim())))
}

async fn skip_headers(reader: &mut BufReader<Stream>) -> Result<()> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Protocol(
                "connection closed inside response headers".to_string(),
            ));
        }
        if line.trim().is_empty() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_url_defaults() {
        let url = ServiceUrl::parse("https://tunnel.example.com").unwrap();
        assert!(url.https);
        assert_eq!(url.authority(), "tunnel.example.com:443");
        assert_eq!(url.path, "/");

        let url = ServiceUrl::parse("http://localhost:7654/tunnel").unwrap();
        assert!(!url.https);
        assert_eq!(url.authority(), "localhost:7654");
        assert_eq!(url.path, "/tunnel");
    }

    #[test]
    fn test_service_url_rejects_unknown_scheme() {
        assert!(ServiceUrl::parse("ftp://example.com").is_err());
        assert!(ServiceUrl::parse("example.com").is_err());
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(
            parse_status_code("HTTP/1.1 101 Switching Protocols\r\n").unwrap(),
            101
        );
        assert_eq!(parse_status_code("HTTP/1.1 403 Forbidden\r\n").unwrap(), 403);
        assert!(parse_status_code("nonsense\r\n").is_err());
    }
}
