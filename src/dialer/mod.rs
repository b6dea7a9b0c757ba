//! Dialers
//!
//! A dialer turns `(network, address)` into an established byte stream.
//! The suite composes a small set of them:
//!
//! - [`DirectDialer`]: plain TCP with a connect timeout
//! - [`IapDialer`]: a tunnel through Google's IAP relay
//! - [`RemoteDialer`]: an upgrade-over-HTTP tunnel to a tunnel server,
//!   itself carried by any of the above
//! - [`MuxedDialer`]: a decorator sharing one multiplexed transport per
//!   destination
//!
//! Which chain a connection uses is decided per routing rule at
//! configuration time, not negotiated at runtime.

mod direct;
mod mux;
mod remote;

pub use direct::{DirectDialer, DEFAULT_DIAL_TIMEOUT};
pub use mux::MuxedDialer;
pub use remote::{RemoteDialer, UPSTREAM_HEADER};

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::TokenProvider;
use crate::common::Stream;
use crate::error::Result;
use crate::iap::{self, ConnectOptions};

/// Open byte streams towards upstreams. `network` is always `tcp`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> Result<Stream>;
}

/// Dialer backed by the IAP relay.
///
/// The relay endpoint is fixed by configuration; the requested network and
/// address are decided by whatever server listens behind the relay, so the
/// dial arguments are ignored.
pub struct IapDialer {
    options: ConnectOptions,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl IapDialer {
    pub fn new(options: ConnectOptions, tokens: Option<Arc<dyn TokenProvider>>) -> Self {
        Self { options, tokens }
    }
}

#[async_trait]
impl Dialer for IapDialer {
    async fn dial(&self, _network: &str, _addr: &str) -> Result<Stream> {
        let tunnel = iap::dial(&self.options, self.tokens.as_deref()).await?;
        Ok(Box::new(tunnel))
    }
}
