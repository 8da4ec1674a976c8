//! Access tokens and the providers that hand them out.
//!
//! The engine never refreshes tokens itself. On an auth failure it calls
//! [`AuthProvider::invalidate`] and asks for a fresh one, at most
//! `max_auth_restarts` times per run.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use sync_types::{AccountId, SyncError};

/// Bearer token for one account.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token, for building the `Authorization` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Obtains access tokens for remote accounts.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Token for `account`. Fails with [`SyncError::Auth`] when none can be had.
    async fn obtain_token(&self, account: &AccountId) -> Result<AccessToken, SyncError>;

    /// Mark the current token for `account` as rejected by the provider.
    async fn invalidate(&self, _account: &AccountId) {}
}

/// Fixed tokens, configured up front.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    tokens: DashMap<AccountId, AccessToken>,
}

impl StaticTokenProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_token(self, account: impl Into<AccountId>, token: impl Into<String>) -> Self {
        self.insert(account, token);
        self
    }

    /// Set the token for an account.
    pub fn insert(&self, account: impl Into<AccountId>, token: impl Into<String>) {
        self.tokens.insert(account.into(), AccessToken::new(token));
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn obtain_token(&self, account: &AccountId) -> Result<AccessToken, SyncError> {
        self.tokens
            .get(account)
            .map(|t| t.value().clone())
            .ok_or_else(|| SyncError::Auth(format!("no token configured for account {}", account)))
    }
}

/// Caches tokens from an inner provider until they are invalidated.
pub struct CachedTokenProvider {
    inner: Arc<dyn AuthProvider>,
    cache: DashMap<AccountId, AccessToken>,
}

impl CachedTokenProvider {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn AuthProvider>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    /// True if a token for `account` is cached.
    pub fn is_cached(&self, account: &AccountId) -> bool {
        self.cache.contains_key(account)
    }
}

#[async_trait]
impl AuthProvider for CachedTokenProvider {
    async fn obtain_token(&self, account: &AccountId) -> Result<AccessToken, SyncError> {
        if let Some(token) = self.cache.get(account).map(|t| t.value().clone()) {
            return Ok(token);
        }
        let token = self.inner.obtain_token(account).await?;
        self.cache.insert(account.clone(), token.clone());
        Ok(token)
    }

    async fn invalidate(&self, account: &AccountId) {
        self.cache.remove(account);
        self.inner.invalidate(account).await;
    }
}
