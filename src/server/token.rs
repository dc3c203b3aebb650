//! Upstream token minting.
//!
//! Exchanges the server-held API key for a short-lived streaming token:
//! `POST {base_url}/v1/streaming.create_token` with an `x-api-key` header,
//! answered by `{"data":{"token":"..."}}`.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ServerConfig;

const CREATE_TOKEN_PATH: &str = "/v1/streaming.create_token";

#[derive(Error, Debug)]
pub enum MintError {
    #[error("Missing API key")]
    MissingApiKey,

    #[error("upstream token request failed: {0}")]
    Upstream(String),
}

#[derive(Deserialize)]
struct TokenEnvelope {
    data: TokenData,
}

#[derive(Deserialize)]
struct TokenData {
    token: String,
}

#[derive(Clone)]
pub struct TokenMinter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl TokenMinter {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            timeout: config.upstream_timeout,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CREATE_TOKEN_PATH)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn mint(&self) -> Result<String, MintError> {
        let api_key = self.api_key.as_deref().ok_or(MintError::MissingApiKey)?;

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| MintError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MintError::Upstream(format!("HTTP {}", status.as_u16())));
        }

        let envelope: TokenEnvelope = response
            .json()
            .await
            .map_err(|e| MintError::Upstream(format!("invalid response body: {}", e)))?;
        if envelope.data.token.is_empty() {
            return Err(MintError::Upstream("empty token".to_string()));
        }

        debug!("Minted streaming token");
        Ok(envelope.data.token)
    }
}
