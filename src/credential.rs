//! Credential fetcher.
//!
//! Obtains a short-lived bearer token from the token proxy
//! (`POST /api/get-access-token`, plain-text body). Retries with a linearly
//! growing delay and a per-request timeout; the last failure propagates.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::FetchPolicy;
use crate::error::TokenError;

/// Opaque bearer token. Fetched fresh for every (re)start, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Source of session credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, TokenError>;
}

/// HTTP credential fetcher with bounded retry.
pub struct CredentialFetcher {
    client: reqwest::Client,
    endpoint: String,
    policy: FetchPolicy,
}

impl CredentialFetcher {
    pub fn new(endpoint: impl Into<String>, policy: FetchPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            policy,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_once(&self) -> Result<Credential, TokenError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.policy.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| self.classify(e))?;
        let token = body.trim();
        if token.is_empty() {
            return Err(TokenError::EmptyToken);
        }
        Ok(Credential::new(token))
    }

    fn classify(&self, e: reqwest::Error) -> TokenError {
        if e.is_timeout() {
            TokenError::Timeout(self.policy.timeout)
        } else {
            TokenError::from(e)
        }
    }

    /// Delay before attempt `attempt + 1` (1-based).
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.policy.base_delay * attempt
    }
}

#[async_trait]
impl CredentialSource for CredentialFetcher {
    async fn fetch(&self) -> Result<Credential, TokenError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_once().await {
                Ok(credential) => {
                    debug!(attempt, "Fetched session credential");
                    return Ok(credential);
                }
                Err(e) if attempt < attempts => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Credential fetch failed: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempts, "Credential fetch giving up: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

/// A fixed token, for offline demos against the mock SDK.
pub struct StaticCredential(Credential);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Credential::new(token))
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn fetch(&self) -> Result<Credential, TokenError> {
        Ok(self.0.clone())
    }
}
