//! Configuration for the proxy command
//!
//! A configuration document holds a dial timeout and an ordered list of
//! rules; each rule names a tunnel (a service URL or an IAP instance) and
//! the upstream patterns it serves:
//!
//! ```json
//! {
//!   "dial_timeout": 10,
//!   "rules": [
//!     {
//!       "tunnel": { "service_url": "https://tunnel.example.run.app" },
//!       "upstreams": ["10.0.0.0/8"]
//!     },
//!     {
//!       "tunnel": { "instance": "bastion", "project": "p", "zone": "z", "mux": true },
//!       "upstreams": []
//!     }
//!   ]
//! }
//! ```
//!
//! An empty `upstreams` list means the tunnel serves every target.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{CachedTokenProvider, FileTokenProvider, TokenProvider};
use crate::dialer::{Dialer, DirectDialer, IapDialer, MuxedDialer, RemoteDialer};
use crate::error::{Error, Result};
use crate::iap::ConnectOptions;
use crate::router::{RuleTable, UpstreamRule};
use crate::server::DEFAULT_PORT;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Dial timeout for direct connections, in seconds. 0 means default.
    #[serde(default)]
    pub dial_timeout: u64,

    /// Routing rules, scanned in order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Upstream patterns this tunnel serves. Empty means match-all.
    #[serde(default)]
    pub upstreams: Vec<String>,
}

/// One tunnel endpoint: either an upgrade tunnel server (`service_url`) or
/// an IAP-relayed instance (`instance` + `project` + `zone`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bearer token file, e.g. written by `gcloud auth print-identity-token`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Share one multiplexed transport for all connections to this tunnel.
    #[serde(default)]
    pub mux: bool,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// Build the routing table: one rule entry per upstream pattern, each
    /// sharing its tunnel's dialer chain.
    pub fn build_rules(&self) -> Result<RuleTable> {
        let mut rules = Vec::new();

        for rule in &self.rules {
            let dialer = rule.tunnel.build_dialer(self.dial_timeout())?;

            if rule.upstreams.is_empty() {
                rules.push(UpstreamRule::new("*", dialer));
                continue;
            }

            for upstream in &rule.upstreams {
                rules.push(UpstreamRule::new(upstream.clone(), dialer.clone()));
            }
        }

        Ok(RuleTable::new(rules))
    }
}

impl TunnelConfig {
    /// Build the dialer chain for this tunnel: transport (direct or IAP),
    /// optionally multiplexed, carrying the upgrade tunnel client.
    pub fn build_dialer(&self, timeout: Duration) -> Result<Arc<dyn Dialer>> {
        let tokens = self.token_provider();

        if let Some(service_url) = &self.service_url {
            let mut transport: Arc<dyn Dialer> = Arc::new(DirectDialer::new(timeout));
            if self.mux {
                transport = Arc::new(MuxedDialer::new(transport));
            }
            return Ok(Arc::new(RemoteDialer::new(service_url, tokens, transport)?));
        }

        if let Some(instance) = &self.instance {
            let options = ConnectOptions::new(
                self.project.clone().unwrap_or_default(),
                self.zone.clone().unwrap_or_default(),
                instance.clone(),
                self.port.unwrap_or(DEFAULT_PORT),
            );

            let mut transport: Arc<dyn Dialer> =
                Arc::new(IapDialer::new(options, tokens.clone()));
            if self.mux {
                transport = Arc::new(MuxedDialer::new(transport));
            }
            // The tunnel server sits behind the relay; the URL only carries
            // the request path.
            return Ok(Arc::new(RemoteDialer::new("http://unused", tokens, transport)?));
        }

        Err(Error::Config(
            "tunnel requires a service_url or an instance".to_string(),
        ))
    }

    pub fn token_provider(&self) -> Option<Arc<dyn TokenProvider>> {
        self.token_file.as_ref().map(|path| {
            Arc::new(CachedTokenProvider::new(FileTokenProvider::new(path)))
                as Arc<dyn TokenProvider>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::from_json(r#"{}"#).unwrap();
        assert_eq!(config.dial_timeout, 0);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_json(
            r#"{
                "dial_timeout": 10,
                "rules": [
                    {
                        "tunnel": { "service_url": "https://tunnel.example.com" },
                        "upstreams": ["10.0.0.0/8", "db.internal:5432"]
                    },
                    {
                        "tunnel": {
                            "instance": "bastion",
                            "project": "my-project",
                            "zone": "europe-west1-b",
                            "mux": true
                        },
                        "upstreams": []
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.dial_timeout, 10);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(
            config.rules[0].tunnel.service_url.as_deref(),
            Some("https://tunnel.example.com")
        );
        assert!(config.rules[1].tunnel.mux);
    }

    #[test]
    fn test_build_rules_expands_upstreams() {
        let config = Config::from_json(
            r#"{
                "rules": [
                    {
                        "tunnel": { "service_url": "http://localhost:7654" },
                        "upstreams": ["10.0.0.0/8", "db.internal:5432"]
                    }
                ]
            }"#,
        )
        .unwrap();

        let table = config.build_rules().unwrap();
        assert!(table.find("10.1.2.3:80").is_some());
        assert!(table.find("db.internal:5432").is_some());
        assert!(table.find("example.com:80").is_none());
    }

    #[test]
    fn test_empty_upstreams_match_all() {
        let config = Config::from_json(
            r#"{"rules": [{"tunnel": {"service_url": "http://localhost:7654"}}]}"#,
        )
        .unwrap();

        let table = config.build_rules().unwrap();
        assert!(table.find("anything:1").is_some());
    }

    #[test]
    fn test_tunnel_requires_endpoint() {
        let config = TunnelConfig::default();
        assert!(config.build_dialer(Duration::ZERO).is_err());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            Config::from_json("not json"),
            Err(Error::Config(_))
        ));
    }
}
