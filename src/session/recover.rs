//! Recovery execution: soft restart and the bounded hard-reset loop.
//!
//! Both tiers run in a spawned task holding the recovery guard's permit, so
//! at most one recovery is in flight per controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Runtime, SessionState, Shared, stop_handle};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::health::TransientFault;
use crate::recovery::{self, RecoveryTier};
use crate::sdk::{self, AvatarHandle};

impl Shared {
    /// Run `tier` for the handle of `generation` unless a recovery is
    /// already in flight.
    pub(super) fn request_recovery(
        self: &Arc<Self>,
        generation: u64,
        tier: RecoveryTier,
        fault: TransientFault,
    ) {
        let Some(permit) = self.recovery_guard.try_enter() else {
            info!(?tier, ?fault, "Recovery already in progress, ignoring");
            return;
        };
        let shared = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match tier {
                RecoveryTier::Soft => shared.soft_restart(generation, fault).await,
                RecoveryTier::Hard => shared.hard_reset(generation, fault).await,
            }
        });
    }

    /// Restart the voice sub-channel on the existing handle, or probe the
    /// handle when there is no voice channel.
    async fn soft_restart(self: &Arc<Self>, generation: u64, fault: TransientFault) {
        let (handle, voice, channel) = {
            let mut rt = self.runtime.lock().await;
            let voice = rt.voice_wanted;
            let Some(active) = rt.active_mut(generation) else {
                debug!(generation, "Soft restart target already released");
                return;
            };
            (active.handle.clone(), voice, active.voice.take())
        };
        info!(session = handle.session_id(), ?fault, "Soft restart");

        if let Some(channel) = channel {
            channel.close(handle.as_ref()).await;
        }
        let result = if voice {
            self.open_voice(handle.as_ref()).await.map(Some)
        } else {
            handle
                .keep_alive()
                .await
                .map(|()| None)
                .map_err(SessionError::Sdk)
        };

        match result {
            Ok(channel) => {
                let orphan = {
                    let mut rt = self.runtime.lock().await;
                    match rt.active_mut(generation) {
                        Some(active) => {
                            active.voice = channel;
                            None
                        }
                        None => Some(channel),
                    }
                };
                match orphan {
                    None => {
                        info!(session = handle.session_id(), "Soft restart succeeded");
                        self.set_state(SessionState::Connected);
                    }
                    // session released meanwhile
                    Some(Some(channel)) => channel.close(handle.as_ref()).await,
                    Some(None) => {}
                }
            }
            Err(e) => {
                warn!(session = handle.session_id(), "Soft restart failed: {}", e);
                let escalate = {
                    let rt = self.runtime.lock().await;
                    recovery::should_escalate(fault, &rt.counters)
                };
                if escalate {
                    self.hard_reset(generation, fault).await;
                }
            }
        }
    }

    /// Tear the session down and rebuild it, up to the reconnect bound.
    /// Exhausting the bound leaves the controller `Failed`.
    async fn hard_reset(self: &Arc<Self>, generation: u64, fault: TransientFault) {
        let attempt = {
            let mut rt = self.runtime.lock().await;
            if rt.active_mut(generation).is_none() {
                debug!(generation, "Hard reset target already released");
                return;
            }
            let token = self.root.child_token();
            if let Some(previous) = rt.attempt.replace(token.clone()) {
                previous.cancel();
            }
            token
        };

        let max = self.policy.max_reconnect_attempts;
        let mut tries = 0;
        let mut previous: Option<Arc<dyn AvatarHandle>> = None;
        loop {
            let next = {
                let mut rt = self.runtime.lock().await;
                if attempt.is_cancelled() {
                    return;
                }
                // a ready stream resets the shared counter, so bound locally too
                let claimed = if tries < max {
                    rt.counters.begin_reconnect_attempt()
                } else {
                    None
                };
                match claimed {
                    Some(n) => {
                        let delay = if n == 1 {
                            Duration::ZERO
                        } else {
                            rt.backoff.next_delay()
                        };
                        let config = self.reset_config(&mut rt);
                        self.set_state(SessionState::Reconnecting);
                        Some((n, delay, config, rt.voice_wanted))
                    }
                    None => None,
                }
            };
            let Some((n, delay, config, voice)) = next else {
                self.exhaust(&attempt, tries).await;
                return;
            };
            tries += 1;

            info!(attempt = n, max, ?fault, ?delay, "Hard reset");
            if let Some(handle) = self.release_active().await {
                previous = Some(handle);
            }
            if !pause(delay + self.policy.settle_delay, &attempt).await {
                return;
            }

            match self.restore(config, voice, previous.as_ref(), &attempt).await {
                Ok(()) => {
                    let mut rt = self.runtime.lock().await;
                    if !attempt.is_cancelled() {
                        rt.attempt = None;
                    }
                    info!(attempt = n, "Hard reset succeeded");
                    return;
                }
                Err(_) if attempt.is_cancelled() => return,
                Err(e) => warn!(attempt = n, "Reconnect attempt failed: {}", e),
            }
        }
    }

    /// Establish a replacement session. A remote that still holds the old
    /// session gets one forced stop and a single retry.
    async fn restore(
        self: &Arc<Self>,
        config: Arc<SessionConfig>,
        voice: bool,
        previous: Option<&Arc<dyn AvatarHandle>>,
        attempt: &CancellationToken,
    ) -> Result<(), SessionError> {
        match self.establish(config.clone(), voice, attempt).await {
            Err(SessionError::Start(e)) if sdk::is_session_already_active(&e) => {
                warn!("Previous session still active remotely, forcing stop and retrying");
                if let Some(handle) = previous {
                    stop_handle(handle.as_ref()).await;
                }
                if !pause(self.policy.settle_delay, attempt).await {
                    return Err(SessionError::Closed);
                }
                self.establish(config, voice, attempt).await
            }
            other => other,
        }
    }

    async fn release_active(&self) -> Option<Arc<dyn AvatarHandle>> {
        let active = self.runtime.lock().await.active.take()?;
        let handle = active.handle.clone();
        self.release(active).await;
        Some(handle)
    }

    async fn exhaust(&self, attempt: &CancellationToken, tries: u32) {
        let active = {
            let mut rt = self.runtime.lock().await;
            if attempt.is_cancelled() {
                return;
            }
            rt.attempt = None;
            let attempts = rt.counters.snapshot().reconnect_attempts.max(tries);
            error!("{}", SessionError::RecoveryExhausted { attempts });
            self.set_state(SessionState::Failed);
            rt.active.take()
        };
        if let Some(active) = active {
            self.release(active).await;
        }
    }

    /// Config for the next reset: the last snapshot, one quality tier lower
    /// if a poor connection was reported since.
    fn reset_config(&self, rt: &mut Runtime) -> Arc<SessionConfig> {
        let base = rt
            .last_config
            .clone()
            .unwrap_or_else(|| Arc::new(self.draft_snapshot()));
        if !std::mem::take(&mut rt.degrade_quality) {
            return base;
        }
        let lowered = base.quality.downgrade();
        if lowered == base.quality {
            return base;
        }
        info!(from = ?base.quality, to = ?lowered, "Lowering avatar quality after poor connection");
        let mut config = (*base).clone();
        config.quality = lowered;
        Arc::new(config)
    }
}

/// Sleep for `delay`; `false` if `cancel` fired first.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(delay) => true,
    }
}
