//! Configuration: `config.toml` schema, defaults and environment overrides.
//!
//! Every section has full defaults, so an empty (or missing) file yields a
//! working configuration. Secrets only ever come from the environment.

mod schema;

pub use schema::{format_duration, parse_duration};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use schema::duration_str;

/// Server-held provider secret.
pub const ENV_API_KEY: &str = "AVATAR_API_KEY";
/// Provider base URL.
pub const ENV_BASE_URL: &str = "AVATAR_BASE_API_URL";
/// Token endpoint used by the session engine.
pub const ENV_TOKEN_ENDPOINT: &str = "AVATAR_TOKEN_ENDPOINT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub session: SessionConfig,
    pub recovery: RecoveryPolicy,
    pub gate: GateConfig,
}

// ── Server ───────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Provider API base URL (e.g. `https://api.heygen.com`).
    pub base_url: String,
    /// Never written back to disk; set through `AVATAR_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(with = "duration_str")]
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            base_url: "https://api.heygen.com".to_string(),
            api_key: None,
            upstream_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

// ── Client (credential fetch) ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub token_endpoint: String,
    pub fetch: FetchPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token_endpoint: "http://127.0.0.1:3000/api/get-access-token".to_string(),
            fetch: FetchPolicy::default(),
        }
    }
}

/// Retry policy for credential fetches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    pub attempts: u32,
    /// Delay before retry `n` is `base_delay * n`.
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(10),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarQuality {
    Low,
    Medium,
    #[default]
    High,
}

impl AvatarQuality {
    /// One tier lower, saturating at `Low`.
    pub fn downgrade(self) -> Self {
        match self {
            AvatarQuality::High => AvatarQuality::Medium,
            AvatarQuality::Medium | AvatarQuality::Low => AvatarQuality::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceEmotion {
    Excited,
    Serious,
    Friendly,
    Soothing,
    Broadcaster,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProviderKind {
    #[default]
    Deepgram,
    Gladia,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Websocket,
    Livekit,
}

/// ICE transport policy for the media connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPolicy {
    #[default]
    All,
    Relay,
}

/// How the avatar treats a speech task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Generate a reply to the text.
    #[default]
    Talk,
    /// Say the text verbatim.
    Repeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub voice_id: Option<String>,
    pub rate: f32,
    pub emotion: Option<VoiceEmotion>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice_id: None,
            rate: 1.0,
            emotion: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub provider: SttProviderKind,
    /// Minimum recognition confidence (0.0 - 1.0).
    pub confidence: f32,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            provider: SttProviderKind::Deepgram,
            confidence: 0.55,
        }
    }
}

/// Per-session parameters handed to the SDK at start time.
///
/// The controller snapshots this before every (re)start; the snapshot is
/// never mutated while the session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub avatar_name: String,
    pub quality: AvatarQuality,
    pub voice: VoiceSettings,
    pub language: String,
    pub stt: SttSettings,
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    pub transport: Transport,
    pub relay: RelayPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            avatar_name: "default".to_string(),
            quality: AvatarQuality::High,
            voice: VoiceSettings::default(),
            language: "en".to_string(),
            stt: SttSettings::default(),
            idle_timeout: Duration::from_secs(120),
            transport: Transport::Websocket,
            relay: RelayPolicy::All,
        }
    }
}

// ── Recovery ─────────────────────────────────────────────────────

/// Recovery tier requested when the stream disconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectAction {
    #[default]
    Soft,
    Hard,
}

/// Thresholds, intervals and backoff shared by the health monitor and the
/// recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub disconnect_action: DisconnectAction,
    pub max_reconnect_attempts: u32,
    pub max_freeze_detections: u32,
    #[serde(with = "duration_str")]
    pub freeze_poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub keep_alive_interval: Duration,
    /// Pause between releasing a session and re-initializing it.
    #[serde(with = "duration_str")]
    pub settle_delay: Duration,
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub backoff_cap: Duration,
    #[serde(with = "duration_str")]
    pub ready_timeout: Duration,
    /// Lower the quality tier for the next reset after a poor-connection event.
    pub adapt_quality: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            disconnect_action: DisconnectAction::Soft,
            max_reconnect_attempts: 3,
            max_freeze_detections: 2,
            freeze_poll_interval: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(60),
            settle_delay: Duration::from_millis(1000),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(20),
            ready_timeout: Duration::from_secs(30),
            adapt_quality: true,
        }
    }
}

// ── Utterance gate ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub enabled: bool,
    pub trigger_words: Vec<String>,
    /// Task type used when forwarding a triggered utterance.
    pub task_type: TaskType,
    /// Send an empty speech task for suppressed turns.
    pub placeholder: bool,
    /// Interrupt the avatar for suppressed turns.
    pub interrupt_on_suppress: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_words: vec!["лобстер".to_string(), "lobster".to_string()],
            task_type: TaskType::Talk,
            placeholder: true,
            interrupt_on_suppress: false,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Default location: `<platform config dir>/avatar-relay/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "avatar-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` (which must exist) or from the default path when
    /// present, then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_API_KEY).filter(|k| !k.is_empty()) {
            self.server.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_BASE_URL).filter(|u| !u.is_empty()) {
            self.server.base_url = url;
        }
        if let Some(endpoint) = lookup(ENV_TOKEN_ENDPOINT).filter(|e| !e.is_empty()) {
            self.client.token_endpoint = endpoint;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.server.base_url).map_err(|e| {
            ConfigError::Invalid(format!("server.base_url {:?}: {}", self.server.base_url, e))
        })?;
        url::Url::parse(&self.client.token_endpoint).map_err(|e| {
            ConfigError::Invalid(format!(
                "client.token_endpoint {:?}: {}",
                self.client.token_endpoint, e
            ))
        })?;

        if self.client.fetch.attempts == 0 {
            return Err(ConfigError::Invalid(
                "client.fetch.attempts must be at least 1".into(),
            ));
        }

        let recovery = &self.recovery;
        if recovery.max_freeze_detections == 0 {
            return Err(ConfigError::Invalid(
                "recovery.max_freeze_detections must be at least 1".into(),
            ));
        }
        if recovery.freeze_poll_interval.is_zero() || recovery.keep_alive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "recovery poll and keep-alive intervals must be non-zero".into(),
            ));
        }
        if recovery.keep_alive_interval >= self.session.idle_timeout {
            return Err(ConfigError::Invalid(format!(
                "recovery.keep_alive_interval ({}) must be below session.idle_timeout ({})",
                format_duration(recovery.keep_alive_interval),
                format_duration(self.session.idle_timeout)
            )));
        }
        if recovery.backoff_base > recovery.backoff_cap {
            return Err(ConfigError::Invalid(
                "recovery.backoff_base must not exceed recovery.backoff_cap".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.session.stt.confidence) {
            return Err(ConfigError::Invalid(format!(
                "session.stt.confidence must be within 0.0..=1.0, got {}",
                self.session.stt.confidence
            )));
        }

        if self.gate.enabled && self.gate.trigger_words.iter().all(|w| w.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "gate.trigger_words must contain at least one word when the gate is enabled"
                    .into(),
            ));
        }

        Ok(())
    }
}
