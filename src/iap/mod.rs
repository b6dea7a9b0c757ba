//! Google IAP relay client
//!
//! The Identity-Aware Proxy TCP relay forwards bytes to a Compute Engine
//! instance's network interface. The relay speaks a small framed
//! subprotocol over a WebSocket that carries binary messages:
//!
//! ```text
//! wss://tunnel.cloudproxy.app/v4/connect?project=..&zone=..&instance=..
//!        │
//!        ├─ Success frame  (0x0001): session id, sent once by the relay
//!        ├─ Data frame     (0x0004): up to 16 KiB of payload
//!        └─ Ack frame      (0x0007): cumulative received byte count
//! ```
//!
//! `dial` performs the WebSocket upgrade and the establishment handshake
//! and returns an [`IapTunnel`], a plain byte stream over the framed wire.

mod conn;
mod frame;
mod ws;

pub use conn::IapTunnel;

use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};

use crate::auth::TokenProvider;
use crate::common::IntoStream;
use crate::error::{Error, Result};
use ws::WsByteStream;

const RELAY_HOST: &str = "tunnel.cloudproxy.app";
const RELAY_PATH: &str = "/v4/connect";
const RELAY_SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";
const RELAY_ORIGIN: &str = "bot:iap-tunneler";

/// Target selector for the relay: which instance, which interface, which port.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub port: u16,
    pub interface: String,
}

impl ConnectOptions {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            instance: instance.into(),
            port,
            interface: "nic0".to_string(),
        }
    }

    fn connect_url(&self) -> String {
        let mut query = Vec::new();

        for (key, value) in [
            ("project", &self.project),
            ("zone", &self.zone),
            ("instance", &self.instance),
        ] {
            if !value.is_empty() {
                query.push(format!("{}={}", key, value));
            }
        }
        query.push(format!("port={}", self.port));
        if !self.interface.is_empty() {
            query.push(format!("interface={}", self.interface));
        }

        format!("wss://{}{}?{}", RELAY_HOST, RELAY_PATH, query.join("&"))
    }
}

/// Connect to the IAP relay and establish a tunnel.
///
/// The returned stream carries the bytes of the TCP connection the relay
/// opened to the configured instance port.
pub async fn dial(
    options: &ConnectOptions,
    tokens: Option<&dyn TokenProvider>,
) -> Result<IapTunnel> {
    let mut request = Request::builder()
        .uri(options.connect_url())
        .header("Host", RELAY_HOST)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Protocol", RELAY_SUBPROTOCOL)
        .header("Origin", RELAY_ORIGIN);

    if let Some(provider) = tokens {
        let token = provider.token().await?;
        request = request.header("Authorization", token.header_value());
    }

    let request = request
        .body(())
        .map_err(|e| Error::Protocol(format!("failed to build relay request: {}", e)))?;

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| Error::Transport(format!("relay handshake failed: {}", e)))?;

    IapTunnel::establish(WsByteStream::new(ws).into_stream()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url_full() {
        let options = ConnectOptions::new("my-project", "europe-west1-b", "vm-1", 7654);
        assert_eq!(
            options.connect_url(),
            "wss://tunnel.cloudproxy.app/v4/connect?\
             project=my-project&zone=europe-west1-b&instance=vm-1&port=7654&interface=nic0"
        );
    }

    #[test]
    fn test_connect_url_omits_empty_values() {
        let options = ConnectOptions::new("", "", "vm-1", 22);
        let url = options.connect_url();
        assert!(!url.contains("project="));
        assert!(!url.contains("zone="));
        assert!(url.contains("instance=vm-1"));
        assert!(url.contains("port=22"));
        assert!(url.contains("interface=nic0"));
    }
}
