//! Access token cache
//!
//! Holds the Daraja bearer token for the whole process. Reads take a shared
//! lock; a refresh is serialized behind a separate mutex so concurrent callers
//! that all see an expired token trigger a single credential exchange.
//!
//! With the `cache` feature a Redis tier can sit behind the in-process copy so
//! several replicas share one token.

use super::config::MAX_TOKEN_EXPIRY_MARGIN_SECS;
use super::wire::{TokenResponse, TOKEN_PATH};
use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[cfg(feature = "cache")]
use crate::cache::{keys::mpesa::AccessTokenKey, Cache, RedisCache};

const PROVIDER: &str = "M-Pesa";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    /// Usable if it stays valid for at least `margin` past `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        now + margin < self.expires_at
    }
}

pub struct TokenCache {
    client: Client,
    token_url: String,
    consumer_key: String,
    consumer_secret: String,
    margin: ChronoDuration,
    request_timeout: Duration,
    current: RwLock<Option<AccessToken>>,
    refresh: Mutex<()>,
    #[cfg(feature = "cache")]
    shared: Option<RedisCache>,
}

impl TokenCache {
    pub fn new(
        client: Client,
        base_url: &str,
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        margin: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            token_url: format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH),
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            margin: ChronoDuration::seconds(
                margin.as_secs().min(MAX_TOKEN_EXPIRY_MARGIN_SECS) as i64,
            ),
            request_timeout,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            #[cfg(feature = "cache")]
            shared: None,
        }
    }

    #[cfg(feature = "cache")]
    pub fn with_shared(mut self, cache: RedisCache) -> Self {
        self.shared = Some(cache);
        self
    }

    async fn cached(&self) -> Option<AccessToken> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|token| token.is_fresh_at(Utc::now(), self.margin))
            .cloned()
    }

    /// Return a valid token, exchanging credentials only when the cached one is
    /// missing or inside the expiry margin.
    pub async fn get_token(&self) -> AppResult<AccessToken> {
        if let Some(token) = self.cached().await {
            debug!("Using cached M-Pesa access token");
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.cached().await {
            debug!("M-Pesa access token refreshed by a concurrent caller");
            return Ok(token);
        }

        #[cfg(feature = "cache")]
        if let Some(token) = self.load_shared().await {
            *self.current.write().await = Some(token.clone());
            return Ok(token);
        }

        let token = self.exchange().await?;
        *self.current.write().await = Some(token.clone());

        #[cfg(feature = "cache")]
        self.store_shared(&token).await;

        Ok(token)
    }

    /// Drop a token the provider rejected. A token refreshed since `rejected`
    /// was handed out is kept.
    pub async fn invalidate(&self, rejected: &AccessToken) {
        let mut current = self.current.write().await;
        if current.as_ref().map(|t| t.value == rejected.value).unwrap_or(false) {
            warn!("Discarding M-Pesa access token rejected by provider");
            *current = None;

            #[cfg(feature = "cache")]
            if let Some(shared) = &self.shared {
                let key = AccessTokenKey::new(&self.consumer_key).to_string();
                if let Err(e) = <RedisCache as Cache<AccessToken>>::delete(shared, &key).await {
                    warn!("Failed to drop shared M-Pesa token: {}", e);
                }
            }
        }
    }

    async fn exchange(&self) -> AppResult<AccessToken> {
        info!("Requesting new M-Pesa access token");

        let credentials = STANDARD.encode(format!("{}:{}", self.consumer_key, self.consumer_secret));

        let response = timeout(
            self.request_timeout,
            self.client
                .get(&self.token_url)
                .header("Authorization", format!("Basic {}", credentials))
                .send(),
        )
        .await
        .map_err(|_| {
            AppError::authentication(
                PROVIDER,
                format!(
                    "token request timed out after {} seconds",
                    self.request_timeout.as_secs()
                ),
            )
        })?
        .map_err(|e| AppError::authentication(PROVIDER, format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "M-Pesa token exchange rejected");
            return Err(AppError::authentication(
                PROVIDER,
                format!("token endpoint returned HTTP {}: {}", status, body.trim()),
            ));
        }

        let parsed: TokenResponse = response.json().await.map_err(|e| {
            AppError::authentication(PROVIDER, format!("invalid token response: {}", e))
        })?;

        if parsed.access_token.is_empty() || parsed.expires_in <= 0 {
            return Err(AppError::authentication(
                PROVIDER,
                "token response carried no usable token",
            ));
        }

        let token = AccessToken {
            value: parsed.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(parsed.expires_in),
        };
        info!(expires_at = %token.expires_at, "M-Pesa access token obtained");
        Ok(token)
    }

    #[cfg(feature = "cache")]
    async fn load_shared(&self) -> Option<AccessToken> {
        let shared = self.shared.as_ref()?;
        let key = AccessTokenKey::new(&self.consumer_key).to_string();
        match <RedisCache as Cache<AccessToken>>::get(shared, &key).await {
            Ok(Some(token)) if token.is_fresh_at(Utc::now(), self.margin) => {
                debug!("Using shared M-Pesa access token");
                Some(token)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Shared token lookup failed: {}", e);
                None
            }
        }
    }

    #[cfg(feature = "cache")]
    async fn store_shared(&self, token: &AccessToken) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let remaining = (token.expires_at - Utc::now() - self.margin).num_seconds();
        if remaining <= 0 {
            return;
        }
        let key = AccessTokenKey::new(&self.consumer_key).to_string();
        if let Err(e) = shared
            .set(&key, token, Some(Duration::from_secs(remaining as u64)))
            .await
        {
            warn!("Failed to share M-Pesa access token: {}", e);
        }
    }
}
