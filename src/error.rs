//! Error taxonomy for the session engine and its configuration.

use std::time::Duration;

use thiserror::Error;

/// Credential fetch failures. Surfaced to the caller of `start()`.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token proxy returned HTTP {status}")]
    Status { status: u16 },

    #[error("token request failed: {0}")]
    Network(String),

    #[error("token request timed out after {0:?}")]
    Timeout(Duration),

    #[error("token proxy returned an empty token")]
    EmptyToken,
}

impl From<reqwest::Error> for TokenError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TokenError::Status {
                status: status.as_u16(),
            },
            None => TokenError::Network(e.to_string()),
        }
    }
}

/// Failures of user-initiated session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("failed to initialize avatar session: {0:#}")]
    Initialize(#[source] anyhow::Error),

    #[error("avatar session start rejected: {0:#}")]
    Start(#[source] anyhow::Error),

    #[error("failed to open voice chat: {0:#}")]
    Voice(#[source] anyhow::Error),

    #[error("stream did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("session closed before the stream became ready")]
    Closed,

    #[error("no connected avatar session")]
    NotReady,

    #[error("avatar call failed: {0:#}")]
    Sdk(#[source] anyhow::Error),

    #[error("recovery exhausted after {attempts} reconnect attempts")]
    RecoveryExhausted { attempts: u32 },
}

/// Failure forwarding or suppressing a user utterance. Logged only.
#[derive(Error, Debug)]
#[error("failed to dispatch utterance for turn {turn}: {source:#}")]
pub struct GateDispatchError {
    pub turn: u64,
    #[source]
    pub source: anyhow::Error,
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
