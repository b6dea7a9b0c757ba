//! HTTP proxy handler
//!
//! Two request shapes are honored:
//! - `CONNECT host:port` opens a tunnel and relays raw bytes after `200`
//! - `GET http://host/...` is rewritten to origin form and forwarded over
//!   the routed dialer (a minimal reverse proxy)
//!
//! Everything else is answered with `405`.

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::ProxyServer;
use crate::common::{relay, Stream};
use crate::error::{Error, Result};

const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_405_METHOD_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n";

pub(crate) async fn handle(proxy: &ProxyServer, stream: Stream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let request = parse_request(&mut reader).await?;

    debug!(
        "http proxy request: {} {} (mode: {})",
        request.method,
        request.target,
        if request.is_connect() { "tunnel" } else { "forward" }
    );

    if request.is_connect() {
        handle_connect(proxy, reader, request).await
    } else if request.method.eq_ignore_ascii_case("GET") && request.target.starts_with("http://") {
        handle_forward(proxy, reader, request).await
    } else {
        reader.write_all(RESPONSE_405_METHOD_NOT_ALLOWED).await?;
        reader.flush().await?;
        Ok(())
    }
}

/// CONNECT: dial the target and become a transparent byte relay.
async fn handle_connect(
    proxy: &ProxyServer,
    mut client: BufReader<Stream>,
    request: HttpRequest,
) -> Result<()> {
    let target = ensure_port(&request.target, 443);

    let upstream = match proxy.dial("tcp", &target).await {
        Ok(stream) => stream,
        Err(e) => {
            let response = format!(
                "HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\nUnable to dial {}, error: {}\n",
                target, e
            );
            client.write_all(response.as_bytes()).await?;
            client.flush().await?;
            return Ok(());
        }
    };

    client.write_all(RESPONSE_200_ESTABLISHED).await?;
    client.flush().await?;

    relay(Box::new(client), upstream).await;
    Ok(())
}

/// GET with an absolute URI: forward the rewritten request and relay the
/// rest of the connection.
async fn handle_forward(
    proxy: &ProxyServer,
    mut client: BufReader<Stream>,
    request: HttpRequest,
) -> Result<()> {
    let target = match request.forward_target() {
        Ok(target) => target,
        Err(e) => {
            debug!("cannot determine forward target: {}", e);
            client.write_all(RESPONSE_405_METHOD_NOT_ALLOWED).await?;
            client.flush().await?;
            return Ok(());
        }
    };

    let mut upstream = match proxy.dial("tcp", &target).await {
        Ok(stream) => stream,
        Err(e) => {
            let response = format!(
                "HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\nUnable to dial {}, error: {}\n",
                target, e
            );
            client.write_all(response.as_bytes()).await?;
            client.flush().await?;
            return Ok(());
        }
    };

    upstream.write_all(&request.to_forward_bytes()).await?;
    upstream.flush().await?;

    relay(Box::new(client), upstream).await;
    Ok(())
}

/// Parsed HTTP request
struct HttpRequest {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
    body: Option<BytesMut>,
}

impl HttpRequest {
    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `host:port` of an absolute-URI request, defaulting to port 80.
    fn forward_target(&self) -> Result<String> {
        let Some(rest) = self.target.strip_prefix("http://") else {
            return Err(Error::Protocol(format!(
                "cannot determine target from: {}",
                self.target
            )));
        };
        let host = rest.split('/').next().unwrap_or(rest);
        if host.is_empty() {
            return Err(Error::Protocol(format!(
                "cannot determine target from: {}",
                self.target
            )));
        }
        Ok(ensure_port(host, 80))
    }

    /// Path for forwarding (removes the absolute URI prefix)
    fn forward_path(&self) -> &str {
        if let Some(rest) = self.target.strip_prefix("http://") {
            if let Some(pos) = rest.find('/') {
                return &rest[pos..];
            }
            return "/";
        }
        &self.target
    }

    /// Reconstruct the request in origin form for the upstream.
    fn to_forward_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.forward_path().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");

        // Headers (skip proxy-specific headers)
        for (key, value) in &self.headers {
            if key.starts_with("proxy-") {
                continue;
            }
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"\r\n");

        if let Some(body) = &self.body {
            buf.extend_from_slice(body);
        }

        buf
    }
}

async fn parse_request(reader: &mut BufReader<Stream>) -> Result<HttpRequest> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Protocol(format!(
            "invalid request line: {}",
            line.trim()
        )));
    };
    let method = method.to_string();
    let target = target.to_string();
    let version = version.to_string();

    let mut headers = Vec::new();
    let mut content_length = None;
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
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();

            if key == "content-length" {
                content_length = value.parse().ok();
            }

            headers.push((key, value));
        }
    }

    let body = match content_length {
        Some(len) if len > 0 => {
            let mut body = BytesMut::zeroed(len);
            reader.read_exact(&mut body).await?;
            Some(body)
        }
        _ => None,
    };

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

/// Append a default port when the target has none.
fn ensure_port(target: &str, default_port: u16) -> String {
    match target.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => target.to_string(),
        _ => format!("{}:{}", target, default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, target: &str, headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: None,
        }
    }

    #[test]
    fn test_forward_target() {
        let req = request("GET", "http://example.com/index.html", &[]);
        assert_eq!(req.forward_target().unwrap(), "example.com:80");

        let req = request("GET", "http://example.com:8080/x", &[]);
        assert_eq!(req.forward_target().unwrap(), "example.com:8080");

        let req = request("GET", "/index.html", &[]);
        assert!(req.forward_target().is_err());
    }

    #[test]
    fn test_to_forward_bytes_rewrites_uri_and_drops_proxy_headers() {
        let req = request(
            "GET",
            "http://example.com/a/b",
            &[("host", "example.com"), ("proxy-connection", "keep-alive")],
        );

        let bytes = req.to_forward_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("GET /a/b HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com\r\n"));
        assert!(!text.contains("proxy-connection"));
    }

    #[test]
    fn test_ensure_port() {
        assert_eq!(ensure_port("example.com", 443), "example.com:443");
        assert_eq!(ensure_port("example.com:8443", 443), "example.com:8443");
    }
}
