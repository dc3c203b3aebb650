//! Voice sub-channel: a microphone track feeding the avatar's voice chat.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::sdk::{AvatarHandle, Microphone, MicrophoneTrack, VoiceChatOptions};

/// Owns the microphone track for as long as voice chat is open. The track
/// is stopped on close and on drop.
pub(crate) struct VoiceChannel {
    track: Box<dyn MicrophoneTrack>,
}

impl VoiceChannel {
    pub(crate) async fn open(handle: &dyn AvatarHandle, microphone: &dyn Microphone) -> Result<Self> {
        let mut track = microphone
            .acquire()
            .await
            .context("failed to acquire microphone")?;

        let options = VoiceChatOptions {
            use_silence_prompt: false,
            input_track: Some(track.id().to_string()),
        };
        if let Err(e) = handle.start_voice_chat(options).await {
            track.stop();
            return Err(e.context("failed to start voice chat"));
        }

        debug!(session = handle.session_id(), track = track.id(), "Voice chat open");
        Ok(Self { track })
    }

    pub(crate) async fn close(mut self, handle: &dyn AvatarHandle) {
        if let Err(e) = handle.close_voice_chat().await {
            warn!(session = handle.session_id(), "Failed to close voice chat: {:#}", e);
        }
        self.track.stop();
        debug!(session = handle.session_id(), "Voice chat closed");
    }
}

impl Drop for VoiceChannel {
    fn drop(&mut self) {
        self.track.stop();
    }
}
