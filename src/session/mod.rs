//! Session controller.
//!
//! Owns the lifecycle of one avatar session: credential fetch, SDK
//! initialization, start, stream readiness, the optional voice channel,
//! keep-alive, health monitoring and tiered recovery. All SDK events are
//! handled by a single pump task per session handle, in emission order.
//!
//! Locking: the runtime mutex is only held for bookkeeping and never across
//! an SDK call.

mod events;
mod recover;
mod voice;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::concurrency::ReentrancyGuard;
use crate::config::{Config, GateConfig, RecoveryPolicy, SessionConfig, TaskType};
use crate::credential::CredentialSource;
use crate::error::SessionError;
use crate::gate::{TriggerMatcher, UtteranceGate};
use crate::health::PlaybackProgress;
use crate::keepalive::KeepAliveTicker;
use crate::recovery::{Backoff, RetryCounters, RetryCounts};
use crate::sdk::{AvatarHandle, AvatarSdk, MediaSink, MediaStream, Microphone, SdkSession, SpeakRequest};

use voice::VoiceChannel;

/// Lifecycle state, observable through [`SessionController::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl SessionState {
    /// `true` while a session exists or is being built.
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Inactive | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Inactive => "inactive",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Internal state ───────────────────────────────────────────────

/// Everything tied to one SDK handle. Dropping it cancels the handle's
/// listeners and stops the microphone track.
struct ActiveSession {
    generation: u64,
    handle: Arc<dyn AvatarHandle>,
    /// Cancels the event pump, keep-alive and freeze poller of this handle.
    listeners: CancellationToken,
    gate: UtteranceGate,
    voice: Option<VoiceChannel>,
    keep_alive: Option<KeepAliveTicker>,
    health_tx: mpsc::UnboundedSender<PlaybackProgress>,
    freeze_poller: bool,
    ready_tx: Option<oneshot::Sender<()>>,
    ready: bool,
    /// Still inside start/reset; faults abort the attempt instead of
    /// scheduling recovery.
    establishing: bool,
    aborted: bool,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.listeners.cancel();
    }
}

struct Runtime {
    active: Option<ActiveSession>,
    /// Config snapshot of the last successful start, reused by hard resets.
    last_config: Option<Arc<SessionConfig>>,
    voice_wanted: bool,
    counters: RetryCounters,
    backoff: Backoff,
    /// In-flight start or recovery attempt; cancelled by `stop()`.
    attempt: Option<CancellationToken>,
    /// Poor connection reported; the next hard reset downgrades quality.
    degrade_quality: bool,
}

impl Runtime {
    fn active_mut(&mut self, generation: u64) -> Option<&mut ActiveSession> {
        self.active
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

struct Shared {
    sdk: Arc<dyn AvatarSdk>,
    credentials: Arc<dyn CredentialSource>,
    microphone: Option<Arc<dyn Microphone>>,
    sink: Option<Arc<dyn MediaSink>>,
    policy: RecoveryPolicy,
    gate: GateConfig,
    matcher: TriggerMatcher,
    draft: RwLock<SessionConfig>,
    start_guard: ReentrancyGuard,
    recovery_guard: ReentrancyGuard,
    runtime: Mutex<Runtime>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    root: CancellationToken,
}

// ── Builder ──────────────────────────────────────────────────────

pub struct SessionControllerBuilder {
    sdk: Arc<dyn AvatarSdk>,
    credentials: Arc<dyn CredentialSource>,
    microphone: Option<Arc<dyn Microphone>>,
    sink: Option<Arc<dyn MediaSink>>,
    policy: RecoveryPolicy,
    gate: GateConfig,
    session: SessionConfig,
}

impl SessionControllerBuilder {
    /// Microphone used for voice chat. Without one, voice starts fail.
    pub fn microphone(mut self, microphone: Arc<dyn Microphone>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    /// Video sink the stream is bound to; enables freeze detection.
    pub fn sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    /// Initial draft configuration.
    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Take policy, gate and draft from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.policy(config.recovery)
            .gate(config.gate.clone())
            .session_config(config.session.clone())
    }

    pub fn build(self) -> Result<SessionController, regex::Error> {
        let matcher = TriggerMatcher::new(&self.gate.trigger_words)?;
        let (state, _) = watch::channel(SessionState::Inactive);
        let shared = Shared {
            sdk: self.sdk,
            credentials: self.credentials,
            microphone: self.microphone,
            sink: self.sink,
            policy: self.policy,
            gate: self.gate,
            matcher,
            draft: RwLock::new(self.session),
            start_guard: ReentrancyGuard::new("start"),
            recovery_guard: ReentrancyGuard::new("recovery"),
            runtime: Mutex::new(Runtime {
                active: None,
                last_config: None,
                voice_wanted: false,
                counters: RetryCounters::new(&self.policy),
                backoff: Backoff::from_policy(&self.policy),
                attempt: None,
                degrade_quality: false,
            }),
            state,
            generation: AtomicU64::new(0),
            root: CancellationToken::new(),
        };
        Ok(SessionController {
            shared: Arc::new(shared),
        })
    }
}

// ── Controller ───────────────────────────────────────────────────

/// Drives one avatar session at a time. Dropping the controller closes the
/// session without waiting.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn builder(
        sdk: Arc<dyn AvatarSdk>,
        credentials: Arc<dyn CredentialSource>,
    ) -> SessionControllerBuilder {
        SessionControllerBuilder {
            sdk,
            credentials,
            microphone: None,
            sink: None,
            policy: RecoveryPolicy::default(),
            gate: GateConfig::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Copy of the draft configuration.
    pub fn draft(&self) -> SessionConfig {
        self.shared.draft_snapshot()
    }

    /// Edit the draft. A running session keeps the snapshot it started
    /// with; edits apply from the next `start()`.
    pub fn update_draft(&self, edit: impl FnOnce(&mut SessionConfig)) {
        let mut draft = self
            .shared
            .draft
            .write()
            .unwrap_or_else(|e| e.into_inner());
        edit(&mut draft);
    }

    /// Configuration snapshot the current session was started with.
    pub async fn active_config(&self) -> Option<SessionConfig> {
        let rt = self.shared.runtime.lock().await;
        rt.last_config.as_deref().cloned()
    }

    pub async fn counters(&self) -> RetryCounts {
        self.shared.runtime.lock().await.counters.snapshot()
    }

    /// Start a session from a snapshot of the draft, optionally with voice
    /// chat. Resolves once the stream is ready (and voice is open).
    ///
    /// A call made while a start is already running, or while a session
    /// exists, is a no-op returning `Ok(())`.
    pub async fn start(&self, voice: bool) -> Result<(), SessionError> {
        let shared = &self.shared;
        let Some(_permit) = shared.start_guard.try_enter() else {
            info!("Session start already in progress, ignoring");
            return Ok(());
        };
        let state = shared.state();
        if state.is_active() {
            info!(%state, "Session already active, ignoring start");
            return Ok(());
        }

        let config = Arc::new(shared.draft_snapshot());
        let attempt = {
            let mut rt = shared.runtime.lock().await;
            rt.counters.reset();
            rt.backoff.reset();
            rt.degrade_quality = false;
            let token = shared.root.child_token();
            rt.attempt = Some(token.clone());
            token
        };

        info!(
            sdk = shared.sdk.name(),
            avatar = %config.avatar_name,
            quality = ?config.quality,
            voice,
            "Starting avatar session"
        );
        shared.set_state(SessionState::Connecting);
        let result = shared.establish(config, voice, &attempt).await;

        if !attempt.is_cancelled() {
            shared.runtime.lock().await.attempt = None;
        }
        match result {
            Ok(()) => {
                info!("Avatar session started");
                Ok(())
            }
            Err(e) => {
                warn!("Avatar session start failed: {}", e);
                if !attempt.is_cancelled() {
                    shared.set_state(SessionState::Inactive);
                }
                Err(e)
            }
        }
    }

    /// Close the session and release every resource. Safe to call in any
    /// state, any number of times.
    pub async fn stop(&self) {
        self.shared.shutdown(SessionState::Inactive).await;
    }

    /// Make the avatar say `text`.
    pub async fn speak(&self, text: impl Into<String>, task_type: TaskType) -> Result<(), SessionError> {
        let handle = self.shared.connected_handle().await?;
        handle
            .speak(SpeakRequest {
                text: text.into(),
                task_type,
            })
            .await
            .map_err(SessionError::Sdk)
    }

    pub async fn interrupt(&self) -> Result<(), SessionError> {
        let handle = self.shared.connected_handle().await?;
        handle.interrupt().await.map_err(SessionError::Sdk)
    }

    pub async fn start_listening(&self) -> Result<(), SessionError> {
        let handle = self.shared.connected_handle().await?;
        handle.start_listening().await.map_err(SessionError::Sdk)
    }

    pub async fn stop_listening(&self) -> Result<(), SessionError> {
        let handle = self.shared.connected_handle().await?;
        handle.stop_listening().await.map_err(SessionError::Sdk)
    }

    pub async fn mute_input(&self) -> Result<(), SessionError> {
        let handle = self.shared.connected_handle().await?;
        handle.mute_input_audio().await.map_err(SessionError::Sdk)
    }

    pub async fn unmute_input(&self) -> Result<(), SessionError> {
        let handle = self.shared.connected_handle().await?;
        handle.unmute_input_audio().await.map_err(SessionError::Sdk)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.unmount();
    }
}

// ── Shared internals ─────────────────────────────────────────────

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "Session state changed");
            *current = next;
            true
        });
    }

    fn draft_snapshot(&self) -> SessionConfig {
        self.draft
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn connected_handle(&self) -> Result<Arc<dyn AvatarHandle>, SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotReady);
        }
        let rt = self.runtime.lock().await;
        rt.active
            .as_ref()
            .filter(|active| active.ready)
            .map(|active| active.handle.clone())
            .ok_or(SessionError::NotReady)
    }

    /// One full init → start → ready → voice sequence against a fresh
    /// handle. On failure nothing is left installed.
    async fn establish(
        self: &Arc<Self>,
        config: Arc<SessionConfig>,
        voice: bool,
        attempt: &CancellationToken,
    ) -> Result<(), SessionError> {
        let credential = tokio::select! {
            result = self.credentials.fetch() => result?,
            _ = attempt.cancelled() => return Err(SessionError::Closed),
        };
        let SdkSession { handle, events } = tokio::select! {
            result = self.sdk.initialize(&credential) => result.map_err(SessionError::Initialize)?,
            _ = attempt.cancelled() => return Err(SessionError::Closed),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let listeners = self.root.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        {
            let mut rt = self.runtime.lock().await;
            if attempt.is_cancelled() {
                drop(rt);
                stop_handle(handle.as_ref()).await;
                return Err(SessionError::Closed);
            }
            let previous = rt.active.replace(ActiveSession {
                generation,
                handle: handle.clone(),
                listeners: listeners.clone(),
                gate: UtteranceGate::with_matcher(self.gate.clone(), self.matcher.clone()),
                voice: None,
                keep_alive: None,
                health_tx,
                freeze_poller: false,
                ready_tx: Some(ready_tx),
                ready: false,
                establishing: true,
                aborted: false,
            });
            rt.last_config = Some(config.clone());
            rt.voice_wanted = voice;
            if let Some(previous) = previous {
                warn!(session = previous.handle.session_id(), "Replacing a live session handle");
                self.spawn_release(previous);
            }
        }
        debug!(generation, session = handle.session_id(), "Session handle installed");
        events::spawn_pump(self.clone(), generation, events, health_rx, listeners);

        let started = tokio::select! {
            result = handle.start(&config) => result,
            _ = attempt.cancelled() => return Err(SessionError::Closed),
        };
        if let Err(e) = started {
            self.discard(generation).await;
            return Err(SessionError::Start(e));
        }

        tokio::select! {
            ready = ready_rx => {
                if ready.is_err() {
                    self.discard(generation).await;
                    return Err(SessionError::Closed);
                }
            }
            _ = attempt.cancelled() => return Err(SessionError::Closed),
            _ = time::sleep(self.policy.ready_timeout) => {
                self.discard(generation).await;
                return Err(SessionError::ReadyTimeout(self.policy.ready_timeout));
            }
        }

        let channel = if voice {
            match self.open_voice(handle.as_ref()).await {
                Ok(channel) => Some(channel),
                Err(e) => {
                    self.discard(generation).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut rt = self.runtime.lock().await;
        let installed = !attempt.is_cancelled()
            && rt
                .active_mut(generation)
                .is_some_and(|active| !active.aborted);
        if !installed {
            let active = if rt.active_mut(generation).is_some() {
                rt.active.take()
            } else {
                None
            };
            drop(rt);
            if let Some(channel) = channel {
                channel.close(handle.as_ref()).await;
            }
            if let Some(active) = active {
                self.release(active).await;
            }
            return Err(SessionError::Closed);
        }
        if let Some(active) = rt.active_mut(generation) {
            active.voice = channel;
            active.establishing = false;
        }
        Ok(())
    }

    async fn open_voice(&self, handle: &dyn AvatarHandle) -> Result<VoiceChannel, SessionError> {
        let microphone = self
            .microphone
            .as_deref()
            .ok_or_else(|| SessionError::Voice(anyhow::anyhow!("no microphone configured")))?;
        VoiceChannel::open(handle, microphone)
            .await
            .map_err(SessionError::Voice)
    }

    /// Release the session of `generation` if it is still the active one.
    async fn discard(&self, generation: u64) {
        let active = {
            let mut rt = self.runtime.lock().await;
            if rt.active_mut(generation).is_some() {
                rt.active.take()
            } else {
                None
            }
        };
        if let Some(active) = active {
            self.release(active).await;
        }
    }

    /// Tear down one handle: listeners, voice, sink, remote session.
    async fn release(&self, mut active: ActiveSession) {
        active.listeners.cancel();
        if let Some(ticker) = active.keep_alive.take() {
            ticker.stop();
        }
        if let Some(channel) = active.voice.take() {
            channel.close(active.handle.as_ref()).await;
        }
        if let Some(sink) = &self.sink {
            sink.detach();
        }
        stop_handle(active.handle.as_ref()).await;
        debug!(generation = active.generation, "Session handle released");
    }

    fn spawn_release(self: &Arc<Self>, active: ActiveSession) {
        let shared = self.clone();
        tokio::spawn(async move { shared.release(active).await });
    }

    /// Cancel whatever is in flight, release the session and settle in
    /// `final_state`.
    async fn shutdown(&self, final_state: SessionState) {
        let active = {
            let mut rt = self.runtime.lock().await;
            if let Some(attempt) = rt.attempt.take() {
                attempt.cancel();
            }
            rt.active.take()
        };
        if let Some(active) = active {
            info!(session = active.handle.session_id(), "Stopping avatar session");
            self.release(active).await;
        }
        self.set_state(final_state);
    }

    /// Synchronous teardown for when the controller goes away. Timers stop
    /// immediately; the remote close is fire-and-forget.
    fn unmount(self: &Arc<Self>) {
        self.root.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = self.clone();
                runtime.spawn(async move { shared.shutdown(SessionState::Inactive).await });
            }
            Err(_) => {
                if let Ok(mut rt) = self.runtime.try_lock() {
                    rt.attempt.take();
                    // dropping the session stops the microphone track
                    rt.active.take();
                }
                self.set_state(SessionState::Inactive);
            }
        }
    }
}

async fn stop_handle(handle: &dyn AvatarHandle) {
    if let Err(e) = handle.stop().await {
        warn!(session = handle.session_id(), "Failed to stop avatar session: {:#}", e);
    }
}

/// Bind `stream` to the sink and start the per-handle background tasks.
fn on_ready(shared: &Arc<Shared>, active: &mut ActiveSession, stream: &MediaStream) {
    active.ready = true;
    if let Some(sink) = &shared.sink {
        sink.attach(stream);
        if !active.freeze_poller {
            crate::health::spawn_freeze_poller(
                sink.clone(),
                shared.policy.freeze_poll_interval,
                shared.state.subscribe(),
                active.listeners.child_token(),
                active.health_tx.clone(),
            );
            active.freeze_poller = true;
        }
    }
    if active.keep_alive.is_none() {
        active.keep_alive = Some(KeepAliveTicker::spawn(
            active.handle.clone(),
            shared.policy.keep_alive_interval,
            &active.listeners,
        ));
    }
    if let Some(ready_tx) = active.ready_tx.take() {
        let _ = ready_tx.send(());
    }
}
