//! Event pump: one task per SDK handle, draining SDK events and playback
//! progress in order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionState, Shared, on_ready};
use crate::gate;
use crate::health::{PlaybackProgress, TransientFault};
use crate::recovery::{self, RecoveryTier, StallVerdict};
use crate::sdk::{ConnectionQuality, MediaStream, SdkEvent};

pub(super) fn spawn_pump(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SdkEvent>,
    mut health: mpsc::UnboundedReceiver<PlaybackProgress>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => shared.handle_event(generation, event).await,
                    None => {
                        debug!(generation, "SDK event stream closed");
                        break;
                    }
                },
                Some(progress) = health.recv() => shared.handle_playback(generation, progress).await,
            }
        }
        debug!(generation, "Event pump stopped");
    })
}

impl Shared {
    async fn handle_event(self: &Arc<Self>, generation: u64, event: SdkEvent) {
        match event {
            SdkEvent::StreamReady { stream } => self.on_stream_ready(generation, stream).await,
            SdkEvent::StreamDisconnected => self.on_disconnect(generation).await,
            SdkEvent::ConnectionQualityChanged { quality } => {
                self.on_quality(generation, quality).await
            }
            SdkEvent::AvatarStartTalking => debug!(generation, "Avatar started talking"),
            SdkEvent::AvatarStopTalking => debug!(generation, "Avatar stopped talking"),
            SdkEvent::UserStart => {
                let mut rt = self.runtime.lock().await;
                if let Some(active) = rt
                    .active_mut(generation)
                    .filter(|active| active.gate.is_enabled())
                {
                    let turn = active.gate.begin_turn();
                    debug!(generation, turn, "User started talking");
                }
            }
            SdkEvent::UserStop => debug!(generation, "User stopped talking"),
            SdkEvent::UserTalkingFragment { text } => {
                let mut rt = self.runtime.lock().await;
                if let Some(active) = rt
                    .active_mut(generation)
                    .filter(|active| active.gate.is_enabled())
                {
                    active.gate.append_current(&text);
                }
            }
            SdkEvent::UserEndOfTurn => self.on_end_of_turn(generation).await,
        }
    }

    async fn on_stream_ready(self: &Arc<Self>, generation: u64, stream: MediaStream) {
        {
            let mut rt = self.runtime.lock().await;
            if rt.active_mut(generation).is_none() {
                debug!(generation, "Ignoring stream ready from a released handle");
                return;
            }
            rt.counters.reset();
            rt.backoff.reset();
            if let Some(active) = rt.active_mut(generation) {
                info!(
                    session = active.handle.session_id(),
                    stream = %stream.id,
                    "Stream ready"
                );
                on_ready(self, active, &stream);
            }
        }
        self.set_state(SessionState::Connected);
    }

    async fn on_disconnect(self: &Arc<Self>, generation: u64) {
        {
            let mut rt = self.runtime.lock().await;
            let Some(active) = rt.active_mut(generation) else {
                debug!(generation, "Ignoring disconnect from a released handle");
                return;
            };
            if active.establishing {
                warn!(
                    session = active.handle.session_id(),
                    "Stream disconnected while connecting, aborting attempt"
                );
                active.aborted = true;
                active.ready_tx.take();
                return;
            }
        }

        warn!(generation, "Stream disconnected");
        self.set_state(SessionState::Disconnected);
        if let Some(tier) = recovery::tier_for(TransientFault::Disconnect, &self.policy) {
            self.request_recovery(generation, tier, TransientFault::Disconnect);
        }
    }

    async fn on_quality(&self, generation: u64, quality: ConnectionQuality) {
        let mut rt = self.runtime.lock().await;
        if rt.active_mut(generation).is_none() {
            return;
        }
        match quality {
            ConnectionQuality::Bad => {
                warn!(generation, "Connection quality is poor");
                if self.policy.adapt_quality {
                    rt.degrade_quality = true;
                }
            }
            ConnectionQuality::Good => {
                debug!(generation, "Connection quality is good");
                rt.degrade_quality = false;
            }
            ConnectionQuality::Unknown => debug!(generation, "Connection quality unknown"),
        }
    }

    async fn on_end_of_turn(&self, generation: u64) {
        let (decision, handle) = {
            let mut rt = self.runtime.lock().await;
            let Some(active) = rt.active_mut(generation) else {
                return;
            };
            if !active.gate.is_enabled() {
                return;
            }
            (active.gate.end_turn(), active.handle.clone())
        };
        if let Err(e) = gate::dispatch(&self.gate, handle.as_ref(), decision).await {
            warn!("{}", e);
        }
    }

    async fn handle_playback(self: &Arc<Self>, generation: u64, progress: PlaybackProgress) {
        let verdict = {
            let mut rt = self.runtime.lock().await;
            match rt.active_mut(generation) {
                Some(active) if active.ready && !active.establishing => {}
                _ => return,
            }
            match progress {
                PlaybackProgress::Advanced => {
                    rt.counters.record_progress();
                    return;
                }
                PlaybackProgress::Stalled => rt.counters.record_stall(),
                PlaybackProgress::Skipped => return,
            }
        };

        match verdict {
            StallVerdict::Watching(count) => {
                debug!(generation, count, "Playback stalled");
            }
            StallVerdict::SoftRestart => {
                warn!(generation, "Video frozen, requesting soft restart");
                self.request_recovery(generation, RecoveryTier::Soft, TransientFault::Freeze);
            }
            StallVerdict::Escalate => {
                warn!(generation, "Video still frozen, requesting hard reset");
                self.request_recovery(generation, RecoveryTier::Hard, TransientFault::Freeze);
            }
        }
    }
}
