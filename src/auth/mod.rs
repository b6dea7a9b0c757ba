//! Bearer token plumbing.
//!
//! Every tunnel hop authenticates with a short-lived token. Acquisition is
//! a deployment concern; the suite only needs something that can hand out
//! the current token, which is what [`TokenProvider`] models. A caching
//! decorator keeps providers cheap to call on every dial.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Refresh tokens this close to their expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// A bearer token with an optional expiry instant.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub expiry: Option<SystemTime>,
}

impl Token {
    /// A plain `Bearer` token without a known expiry.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expiry: None,
        }
    }

    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    fn expires_within(&self, skew: Duration) -> bool {
        match self.expiry {
            Some(expiry) => SystemTime::now() + skew >= expiry,
            None => false,
        }
    }
}

/// Source of authentication tokens.
///
/// Implementations must be safe to call from any task.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<Token>;
}

/// Provider returning one fixed token.
pub struct StaticTokenProvider {
    token: Token,
}

impl StaticTokenProvider {
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<Token> {
        Ok(self.token.clone())
    }
}

/// Provider reading a bearer token from a file.
///
/// Covers workflows like `gcloud auth print-identity-token > /path/to/token`;
/// the file is re-read on every call, so wrap it in [`CachedTokenProvider`]
/// when dials are frequent.
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn token(&self) -> Result<Token> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Auth(format!("failed to read token file: {}", e)))?;

        let token = content.trim();
        if token.is_empty() {
            return Err(Error::Auth(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }

        Ok(Token::bearer(token))
    }
}

/// Decorator returning the held token until it is close to expiry.
pub struct CachedTokenProvider<P> {
    inner: P,
    cached: Mutex<Option<Token>>,
}

impl<P: TokenProvider> CachedTokenProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<P: TokenProvider> TokenProvider for CachedTokenProvider<P> {
    async fn token(&self) -> Result<Token> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.expires_within(EXPIRY_SKEW) {
                return Ok(token.clone());
            }
        }

        let fresh = self.inner.token().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        expiry: Option<SystemTime>,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn token(&self) -> Result<Token> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Token {
                access_token: format!("token-{}", n),
                token_type: "Bearer".to_string(),
                expiry: self.expiry,
            })
        }
    }

    #[tokio::test]
    async fn test_cached_provider_reuses_unexpired_token() {
        let provider = CachedTokenProvider::new(CountingProvider {
            calls: AtomicUsize::new(0),
            expiry: Some(SystemTime::now() + Duration::from_secs(3600)),
        });

        let first = provider.token().await.unwrap();
        let second = provider.token().await.unwrap();
        assert_eq!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn test_cached_provider_refreshes_near_expiry() {
        let provider = CachedTokenProvider::new(CountingProvider {
            calls: AtomicUsize::new(0),
            expiry: Some(SystemTime::now() + Duration::from_secs(5)),
        });

        let first = provider.token().await.unwrap();
        let second = provider.token().await.unwrap();
        assert_ne!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn test_token_header_value() {
        let token = Token::bearer("abc");
        assert_eq!(token.header_value(), "Bearer abc");
    }
}
