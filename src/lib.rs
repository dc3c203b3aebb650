//! avatar-relay - session engine and token proxy for streaming talking avatars
//!
//! This crate provides:
//! - A token-minting HTTP proxy that keeps the provider API key server-side
//! - A credential fetcher with bounded retry
//! - A session controller with health monitoring and tiered recovery
//! - A trigger-word gate deciding which user utterances reach the avatar

pub mod concurrency;
pub mod config;
pub mod credential;
pub mod error;
pub mod gate;
pub mod health;
pub mod keepalive;
pub mod recovery;
pub mod sdk;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{ConfigError, GateDispatchError, SessionError, TokenError};
pub use session::{SessionController, SessionState};
