//! Upstream patterns
//!
//! A pattern is one of:
//! - `*`, matching every target
//! - a literal `host:port`
//! - a bare host, matching any port on that host
//! - a CIDR prefix, matching targets whose host part is an address in it

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::dialer::Dialer;

/// One allow-list / routing entry: a pattern and the dialer serving it.
pub struct UpstreamRule {
    pattern: String,
    prefix: Option<IpNet>,
    dialer: Arc<dyn Dialer>,
}

impl UpstreamRule {
    pub fn new(pattern: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        let pattern = pattern.into();
        let prefix = pattern.parse::<IpNet>().ok();
        Self {
            pattern,
            prefix,
            dialer,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.dialer
    }

    pub fn matches(&self, candidate: &str) -> bool {
        if self.pattern == "*" {
            return true;
        }

        if candidate == self.pattern {
            return true;
        }

        let Some(host) = host_part(candidate) else {
            return false;
        };

        if host == self.pattern {
            return true;
        }

        if let Some(prefix) = &self.prefix {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return prefix.contains(&ip);
            }
        }

        false
    }
}

/// Host part of a `host:port` target; brackets around IPv6 hosts are
/// stripped. Targets without a valid port have no host part.
fn host_part(candidate: &str) -> Option<&str> {
    let (host, port) = candidate.rsplit_once(':')?;
    if port.parse::<u16>().is_err() {
        return None;
    }
    Some(host.trim_start_matches('[').trim_end_matches(']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Stream;
    use crate::error::Result;
    use async_trait::async_trait;

    struct NullDialer;

    #[async_trait]
    impl Dialer for NullDialer {
        async fn dial(&self, _network: &str, _addr: &str) -> Result<Stream> {
            unimplemented!("matcher tests never dial")
        }
    }

    fn rule(pattern: &str) -> UpstreamRule {
        UpstreamRule::new(pattern, Arc::new(NullDialer))
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let rule = rule("*");
        assert!(rule.matches("example.com:80"));
        assert!(rule.matches("10.0.0.1:22"));
        assert!(rule.matches("anything"));
    }

    #[test]
    fn test_literal_host_port() {
        let rule = rule("example.com:443");
        assert!(rule.matches("example.com:443"));
        assert!(!rule.matches("example.com:80"));
        assert!(!rule.matches("other.com:443"));
    }

    #[test]
    fn test_host_only_matches_any_port() {
        let rule = rule("example.com");
        assert!(rule.matches("example.com:80"));
        assert!(rule.matches("example.com:443"));
        assert!(!rule.matches("sub.example.com:80"));
        // A bare candidate only matches as a literal.
        assert!(rule.matches("example.com"));
    }

    #[test]
    fn test_cidr_prefix() {
        let rule = rule("10.0.0.0/8");
        assert!(rule.matches("10.1.2.3:22"));
        assert!(!rule.matches("192.168.0.1:22"));
        assert!(!rule.matches("example.com:22"));
    }

    #[test]
    fn test_cidr_ipv6() {
        let rule = rule("fd00::/8");
        assert!(rule.matches("[fd00::1]:22"));
        assert!(!rule.matches("[2001:db8::1]:22"));
    }

    #[test]
    fn test_candidate_without_port() {
        let rule = rule("10.0.0.0/8");
        // No port means no host part to take an address from.
        assert!(!rule.matches("10.1.2.3"));
    }

    #[test]
    fn test_matching_is_deterministic() {
        let rule = rule("10.0.0.0/24");
        for _ in 0..3 {
            assert!(rule.matches("10.0.0.5:22"));
            assert!(!rule.matches("10.0.1.5:22"));
        }
    }
}
