//! Bearer-token management.
//!
//! A [`TokenProvider`] owns the cached token for one remote system. Refreshes
//! are single-flight: callers that saw the same stale token queue on an async
//! mutex and only the first one asks the [`TokenSource`] for a new token.

mod client_credentials;

pub use client_credentials::ClientCredentialsSource;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{ErrorClass, Result};

/// Tokens are treated as expired this long before the issuer says so.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A bearer token tagged with the refresh generation that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    generation: u64,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, generation: u64) -> Self {
        Self {
            value: value.into(),
            generation,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("generation", &self.generation)
            .finish()
    }
}

/// A token as handed out by an issuer.
#[derive(Clone)]
pub struct IssuedToken {
    pub access_token: String,
    /// Lifetime reported by the issuer; `None` for non-expiring tokens.
    pub expires_in: Option<Duration>,
}

/// Issues bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Request a fresh token from the issuer.
    async fn request_token(&self) -> Result<IssuedToken>;

    /// Source name for log lines.
    fn name(&self) -> &str;
}

/// Pre-issued token that cannot be refreshed (e.g. a private-app key).
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn request_token(&self) -> Result<IssuedToken> {
        Ok(IssuedToken {
            access_token: self.token.clone(),
            expires_in: None,
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
struct TokenState {
    current: Option<CachedToken>,
    generation: u64,
}

/// Shared, lazily refreshed bearer-token cache.
pub struct TokenProvider {
    source: Arc<dyn TokenSource>,
    state: Mutex<TokenState>,
    refreshes: AtomicU64,
}

impl TokenProvider {
    /// Create a provider around a token source.
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            state: Mutex::new(TokenState::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Build a provider from configuration.
    pub fn from_config(config: &AuthConfig, client: reqwest::Client) -> Self {
        let source: Arc<dyn TokenSource> = match config {
            AuthConfig::Static { token } => Arc::new(StaticTokenSource::new(token.clone())),
            AuthConfig::ClientCredentials { .. } => {
                Arc::new(ClientCredentialsSource::new(config.clone(), client))
            }
        };
        Self::new(source)
    }

    /// Current token, fetching one if none is cached or it has expired.
    pub async fn token(&self) -> Result<AccessToken> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.current.as_ref().filter(|c| c.is_fresh()) {
            return Ok(AccessToken::new(cached.value.clone(), state.generation));
        }
        self.fetch_locked(&mut state).await
    }

    /// Replace a token the remote side rejected.
    ///
    /// If another caller already refreshed past `stale`, the newer token is
    /// returned without contacting the issuer again.
    pub async fn refresh(&self, stale: &AccessToken) -> Result<AccessToken> {
        let mut state = self.state.lock().await;
        if state.generation != stale.generation {
            if let Some(cached) = state.current.as_ref().filter(|c| c.is_fresh()) {
                debug!(
                    "Token already refreshed by a concurrent caller (generation {})",
                    state.generation
                );
                return Ok(AccessToken::new(cached.value.clone(), state.generation));
            }
        }
        self.fetch_locked(&mut state).await
    }

    /// Number of times the issuer has been contacted.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn fetch_locked(&self, state: &mut TokenState) -> Result<AccessToken> {
        let issued = self.source.request_token().await?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let expires_at = issued
            .expires_in
            .map(|ttl| Instant::now() + ttl.saturating_sub(EXPIRY_MARGIN));
        state.generation += 1;
        state.current = Some(CachedToken {
            value: issued.access_token.clone(),
            expires_at,
        });
        info!(
            "Obtained access token from {} (generation {})",
            self.source.name(),
            state.generation
        );
        Ok(AccessToken::new(issued.access_token, state.generation))
    }
}

/// Run `op` with a bearer token, refreshing and retrying exactly once if the
/// remote side rejects the token.
///
/// A second rejection is returned to the caller unchanged.
pub async fn with_token_refresh<T, F, Fut>(provider: &TokenProvider, mut op: F) -> Result<T>
where
    F: FnMut(AccessToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut token = provider.token().await?;
    let mut refreshed = false;
    loop {
        match op(token.clone()).await {
            Err(err) if err.class() == ErrorClass::Auth && !refreshed => {
                warn!("Access token rejected ({}), refreshing once", err);
                token = provider.refresh(&token).await?;
                refreshed = true;
            }
            other => return other,
        }
    }
}
