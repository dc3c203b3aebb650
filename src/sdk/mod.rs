//! Avatar streaming SDK boundary.
//!
//! The remote avatar service (media negotiation, STT, rendering, LLM replies)
//! sits behind these traits. The session engine only ever talks to an
//! [`AvatarSdk`] and the [`AvatarHandle`]s it hands out.

pub mod mock;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{SessionConfig, TaskType};
use crate::credential::Credential;

// ── Events ───────────────────────────────────────────────────────

/// Opaque descriptor of the remote media stream, bound to a video sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Good,
    Bad,
    Unknown,
}

/// Events emitted by an avatar session, delivered in emission order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkEvent {
    /// Media is flowing; the session is usable.
    StreamReady { stream: MediaStream },
    StreamDisconnected,
    AvatarStartTalking,
    AvatarStopTalking,
    /// User speech onset.
    UserStart,
    /// User speech offset.
    UserStop,
    /// Streamed transcript chunk of the current user turn.
    UserTalkingFragment { text: String },
    /// The user finished their turn.
    UserEndOfTurn,
    ConnectionQualityChanged { quality: ConnectionQuality },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeakRequest {
    pub text: String,
    pub task_type: TaskType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoiceChatOptions {
    pub use_silence_prompt: bool,
    /// Microphone track feeding the voice chat.
    pub input_track: Option<String>,
}

/// Typed SDK failures the engine reacts to specifically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("a session is already active")]
    SessionAlreadyActive,

    #[error("session has been closed")]
    SessionClosed,
}

/// `true` if any error in the chain is [`SdkError::SessionAlreadyActive`].
pub fn is_session_already_active(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<SdkError>() == Some(&SdkError::SessionAlreadyActive))
}

// ── Traits ───────────────────────────────────────────────────────

/// A live avatar session.
#[async_trait]
pub trait AvatarHandle: Send + Sync {
    /// Provider-side session identifier.
    fn session_id(&self) -> &str;

    async fn start(&self, config: &SessionConfig) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn start_listening(&self) -> Result<()>;

    async fn stop_listening(&self) -> Result<()>;

    async fn start_voice_chat(&self, options: VoiceChatOptions) -> Result<()>;

    async fn close_voice_chat(&self) -> Result<()>;

    async fn speak(&self, request: SpeakRequest) -> Result<()>;

    async fn keep_alive(&self) -> Result<()>;

    async fn mute_input_audio(&self) -> Result<()>;

    async fn unmute_input_audio(&self) -> Result<()>;

    async fn interrupt(&self) -> Result<()>;
}

/// A freshly initialized session: the handle plus its event stream.
pub struct SdkSession {
    pub handle: Arc<dyn AvatarHandle>,
    pub events: mpsc::UnboundedReceiver<SdkEvent>,
}

/// Factory for avatar sessions.
#[async_trait]
pub trait AvatarSdk: Send + Sync {
    /// Create a session handle authorized by `credential`.
    async fn initialize(&self, credential: &Credential) -> Result<SdkSession>;

    /// Human-readable SDK name.
    fn name(&self) -> &str;
}

// ── Local media ──────────────────────────────────────────────────

/// An acquired microphone track. Must be stopped to release the device.
pub trait MicrophoneTrack: Send + Sync {
    fn id(&self) -> &str;

    /// Release the device. Calling it again is a no-op.
    fn stop(&mut self);
}

#[async_trait]
pub trait Microphone: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn MicrophoneTrack>>;
}

/// Video surface the remote stream is bound to. Also exposes the playback
/// clock the freeze detector polls.
#[cfg_attr(test, mockall::automock)]
pub trait MediaSink: Send + Sync {
    fn attach(&self, stream: &MediaStream);

    fn detach(&self);

    /// Current playback position in seconds, `None` when nothing is bound.
    fn playback_position(&self) -> Option<f64>;

    fn is_paused(&self) -> bool;
}
