//! Upstream routing
//!
//! Routing works on the requested upstream string alone, no IO: an ordered
//! list of rules, each pairing an upstream pattern with the dialer that
//! serves it. The first matching rule wins.

mod upstream;

pub use upstream::UpstreamRule;

use std::sync::Arc;

use crate::dialer::Dialer;

/// Ordered rule list. Scanning is deterministic: the same target against
/// the same table always resolves to the same rule.
pub struct RuleTable {
    rules: Vec<UpstreamRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<UpstreamRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `target`, if any.
    pub fn find(&self, target: &str) -> Option<&UpstreamRule> {
        self.rules.iter().find(|rule| rule.matches(target))
    }

    /// Resolve `target` to a dialer, falling back to `local` when no rule
    /// matches. The returned mode string is for logging.
    pub fn route<'a>(
        &'a self,
        target: &str,
        local: &'a Arc<dyn Dialer>,
    ) -> (&'static str, &'a Arc<dyn Dialer>) {
        match self.find(target) {
            Some(rule) => ("remote", rule.dialer()),
            None => ("local", local),
        }
    }
}
