//! cloud-tunnel - TCP tunnels over HTTP upgrades and Google's IAP relay
//!
//! # Architecture
//!
//! ```text
//! listener (tcp-forward / HTTP proxy / SOCKS5)
//! → router (upstream pattern match)
//! → dialer chain (direct | iap | remote, optionally muxed)
//! → tunnel handshake (HTTP upgrade or IAP relay frames)
//! → bidirectional relay
//! ```
//!
//! ## Core Principles
//!
//! - Everything below the listeners operates on one boxed `Stream` type
//! - Dialers compose: the upgrade tunnel client rides on direct TCP, on an
//!   IAP relay tunnel, or on a multiplexed session over either
//! - Routing depends only on the requested upstream string, no IO
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Stream type, prepend wrapper, bidirectional relay
//! ├── auth/            # Token providers
//! ├── iap/             # IAP relay subprotocol client
//! ├── mux/             # h2-backed stream multiplexing
//! ├── dialer/          # Direct, IAP, remote (upgrade), muxed dialers
//! ├── router/          # Upstream patterns and rule table
//! ├── server/          # Upgrade tunnel server
//! └── proxy/           # HTTP + SOCKS5 proxy, tcp-forward
//! ```

// Core types
pub mod common;
pub mod error;

// Transport core
pub mod auth;
pub mod dialer;
pub mod iap;
pub mod mux;

// Routing and front-ends
pub mod proxy;
pub mod router;
pub mod server;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{relay, Stream};
pub use config::Config;
pub use dialer::{Dialer, DirectDialer, IapDialer, MuxedDialer, RemoteDialer};
pub use error::{Error, Result};
pub use proxy::{ProxyServer, TcpForwarder};
pub use router::{RuleTable, UpstreamRule};
pub use server::TunnelServer;
