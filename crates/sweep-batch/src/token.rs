//! Cluster API token lifecycle.

use serde::Deserialize;
use std::time::{Duration, Instant};
use sweep_core::{Error, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A cached token is reused until it is at least this old.
pub const TOKEN_MAX_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// A refresh call that has not resolved within this window counts as hung.
pub const TOKEN_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

struct CachedToken {
    value: String,
    refreshed_at: Instant,
}

/// Exchanges credentials for an API token and caches it.
///
/// Refresh policy: a cached token younger than the age gate is returned
/// as-is. A refresh races a fixed timeout; if the call hangs, a stale but
/// previously-valid token is reused silently, and only when no such token
/// exists does the timeout become the fatal [`Error::TokenTimeout`].
pub struct TokenKeeper {
    http: reqwest::Client,
    base_url: String,
    user_name: String,
    password: String,
    max_age: Duration,
    refresh_timeout: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenKeeper {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            user_name: user_name.into(),
            password: password.into(),
            max_age: TOKEN_MAX_AGE,
            refresh_timeout: TOKEN_REFRESH_TIMEOUT,
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Current token, refreshing only past the age gate.
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.refreshed_at.elapsed() < self.max_age {
                return Ok(token.value.clone());
            }
        }

        match tokio::time::timeout(self.refresh_timeout, self.fetch()).await {
            Ok(Ok(value)) => {
                debug!("cluster token refreshed");
                *cached = Some(CachedToken { value: value.clone(), refreshed_at: Instant::now() });
                Ok(value)
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => match cached.as_ref() {
                Some(token) => {
                    warn!("token refresh timed out, reusing previous token");
                    Ok(token.value.clone())
                }
                None => Err(Error::TokenTimeout),
            },
        }
    }

    async fn fetch(&self) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/api/v1/token", self.base_url))
            .json(&serde_json::json!({
                "username": self.user_name,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(Error::cluster)?;
        if !response.status().is_success() {
            return Err(Error::cluster(format!("token request failed: {}", response.status())));
        }
        let body: TokenResponse = response.json().await.map_err(Error::cluster)?;
        Ok(body.token)
    }
}

/// Where the job client gets its token from.
pub enum TokenSource {
    /// User-supplied token used verbatim.
    Static(String),
    Keeper(TokenKeeper),
}

impl TokenSource {
    pub async fn token(&self) -> Result<String> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Keeper(keeper) => keeper.token().await,
        }
    }
}
