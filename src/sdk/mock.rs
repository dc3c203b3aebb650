//! Mock avatar SDK for testing and offline demos.
//!
//! Records every call, fails on demand, and lets the caller inject SDK
//! events into the most recently initialized session. By default a
//! successful `start` immediately emits `StreamReady`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{AvatarQuality, SessionConfig, TaskType};
use crate::credential::Credential;
use crate::sdk::{
    AvatarHandle, AvatarSdk, MediaSink, MediaStream, Microphone, MicrophoneTrack, SdkError,
    SdkEvent, SdkSession, SpeakRequest, VoiceChatOptions,
};

// ── Call log ─────────────────────────────────────────────────────

/// One recorded SDK call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Initialize { session: String },
    Start { session: String, quality: AvatarQuality },
    Stop { session: String },
    StartListening { session: String },
    StopListening { session: String },
    StartVoiceChat { session: String, track: Option<String> },
    CloseVoiceChat { session: String },
    Speak { session: String, text: String, task_type: TaskType },
    KeepAlive { session: String },
    MuteInput { session: String },
    UnmuteInput { session: String },
    Interrupt { session: String },
}

/// Pending scripted failures; each counter is consumed one call at a time.
#[derive(Debug, Default)]
struct Script {
    initialize_failures: u32,
    start_failures: u32,
    already_active_failures: u32,
    voice_failures: u32,
    speak_failures: u32,
    keep_alive_failures: u32,
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

struct MockInner {
    script: Mutex<Script>,
    calls: Mutex<Vec<MockCall>>,
    current: Mutex<Option<mpsc::UnboundedSender<SdkEvent>>>,
    sessions: AtomicU32,
    auto_ready: AtomicBool,
}

impl MockInner {
    fn record(&self, call: MockCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }
}

// ── SDK ──────────────────────────────────────────────────────────

/// Scriptable in-process avatar SDK.
#[derive(Clone)]
pub struct MockAvatarSdk {
    inner: Arc<MockInner>,
}

impl MockAvatarSdk {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Mutex::new(Script::default()),
                calls: Mutex::new(Vec::new()),
                current: Mutex::new(None),
                sessions: AtomicU32::new(0),
                auto_ready: AtomicBool::new(true),
            }),
        }
    }

    /// Whether a successful `start` emits `StreamReady` on its own.
    pub fn with_auto_ready(self, auto_ready: bool) -> Self {
        self.inner.auto_ready.store(auto_ready, Ordering::SeqCst);
        self
    }

    pub fn fail_initialize(&self, times: u32) {
        self.inner.script(|s| s.initialize_failures += times);
    }

    pub fn fail_start(&self, times: u32) {
        self.inner.script(|s| s.start_failures += times);
    }

    /// Reject the next `times` starts with [`SdkError::SessionAlreadyActive`].
    pub fn fail_start_already_active(&self, times: u32) {
        self.inner.script(|s| s.already_active_failures += times);
    }

    pub fn fail_voice_chat(&self, times: u32) {
        self.inner.script(|s| s.voice_failures += times);
    }

    pub fn fail_speak(&self, times: u32) {
        self.inner.script(|s| s.speak_failures += times);
    }

    pub fn fail_keep_alive(&self, times: u32) {
        self.inner.script(|s| s.keep_alive_failures += times);
    }

    /// Inject an event into the latest session. Returns `false` if no
    /// session exists or its receiver is gone.
    pub fn emit(&self, event: SdkEvent) -> bool {
        let current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Emit one complete user turn: start, fragments, end of turn.
    pub fn emit_turn(&self, fragments: &[&str]) -> bool {
        let mut ok = self.emit(SdkEvent::UserStart);
        for fragment in fragments {
            ok &= self.emit(SdkEvent::UserTalkingFragment {
                text: fragment.to_string(),
            });
        }
        ok &= self.emit(SdkEvent::UserStop);
        ok && self.emit(SdkEvent::UserEndOfTurn)
    }

    /// Snapshot of all recorded calls, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner
            .calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Number of sessions successfully initialized.
    pub fn sessions_created(&self) -> u32 {
        self.inner.sessions.load(Ordering::SeqCst)
    }
}

impl Default for MockAvatarSdk {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AvatarSdk for MockAvatarSdk {
    async fn initialize(&self, credential: &Credential) -> Result<SdkSession> {
        if credential.as_str().is_empty() {
            bail!("empty credential");
        }
        if self.inner.script(|s| take(&mut s.initialize_failures)) {
            bail!("mock initialize failure");
        }

        let n = self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{}", n);
        self.inner.record(MockCall::Initialize { session: id.clone() });

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx.clone());

        Ok(SdkSession {
            handle: Arc::new(MockHandle {
                id,
                inner: self.inner.clone(),
                events: tx,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ── Handle ───────────────────────────────────────────────────────

struct MockHandle {
    id: String,
    inner: Arc<MockInner>,
    events: mpsc::UnboundedSender<SdkEvent>,
    closed: AtomicBool,
}

impl MockHandle {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SdkError::SessionClosed.into());
        }
        Ok(())
    }

    fn session(&self) -> String {
        self.id.clone()
    }
}

#[async_trait]
impl AvatarHandle for MockHandle {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn start(&self, config: &SessionConfig) -> Result<()> {
        self.inner.record(MockCall::Start {
            session: self.session(),
            quality: config.quality,
        });
        self.ensure_open()?;
        if self.inner.script(|s| take(&mut s.already_active_failures)) {
            return Err(SdkError::SessionAlreadyActive.into());
        }
        if self.inner.script(|s| take(&mut s.start_failures)) {
            bail!("mock start failure");
        }
        if self.inner.auto_ready.load(Ordering::SeqCst) {
            let _ = self.events.send(SdkEvent::StreamReady {
                stream: MediaStream {
                    id: format!("{}-stream", self.id),
                },
            });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.record(MockCall::Stop {
            session: self.session(),
        });
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_listening(&self) -> Result<()> {
        self.inner.record(MockCall::StartListening {
            session: self.session(),
        });
        self.ensure_open()
    }

    async fn stop_listening(&self) -> Result<()> {
        self.inner.record(MockCall::StopListening {
            session: self.session(),
        });
        self.ensure_open()
    }

    async fn start_voice_chat(&self, options: VoiceChatOptions) -> Result<()> {
        self.inner.record(MockCall::StartVoiceChat {
            session: self.session(),
            track: options.input_track,
        });
        self.ensure_open()?;
        if self.inner.script(|s| take(&mut s.voice_failures)) {
            bail!("mock voice chat failure");
        }
        Ok(())
    }

    async fn close_voice_chat(&self) -> Result<()> {
        self.inner.record(MockCall::CloseVoiceChat {
            session: self.session(),
        });
        Ok(())
    }

    async fn speak(&self, request: SpeakRequest) -> Result<()> {
        self.inner.record(MockCall::Speak {
            session: self.session(),
            text: request.text,
            task_type: request.task_type,
        });
        self.ensure_open()?;
        if self.inner.script(|s| take(&mut s.speak_failures)) {
            bail!("mock speak failure");
        }
        Ok(())
    }

    async fn keep_alive(&self) -> Result<()> {
        self.inner.record(MockCall::KeepAlive {
            session: self.session(),
        });
        self.ensure_open()?;
        if self.inner.script(|s| take(&mut s.keep_alive_failures)) {
            bail!("mock keep-alive failure");
        }
        Ok(())
    }

    async fn mute_input_audio(&self) -> Result<()> {
        self.inner.record(MockCall::MuteInput {
            session: self.session(),
        });
        self.ensure_open()
    }

    async fn unmute_input_audio(&self) -> Result<()> {
        self.inner.record(MockCall::UnmuteInput {
            session: self.session(),
        });
        self.ensure_open()
    }

    async fn interrupt(&self) -> Result<()> {
        self.inner.record(MockCall::Interrupt {
            session: self.session(),
        });
        self.ensure_open()
    }
}

// ── Microphone ───────────────────────────────────────────────────

/// Mock microphone that tracks how many acquired tracks are still live.
#[derive(Clone, Default)]
pub struct MockMicrophone {
    live: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
    failures: Arc<AtomicU32>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks acquired and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn fail_acquire(&self, times: u32) {
        self.failures.fetch_add(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl Microphone for MockMicrophone {
    async fn acquire(&self) -> Result<Box<dyn MicrophoneTrack>> {
        let denied = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if denied {
            return Err(anyhow!("microphone permission denied"));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTrack {
            id: format!("mic-{}", n),
            live: self.live.clone(),
            stopped: false,
        }))
    }
}

struct MockTrack {
    id: String,
    live: Arc<AtomicUsize>,
    stopped: bool,
}

impl MicrophoneTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ── Video sink ───────────────────────────────────────────────────

#[derive(Default)]
struct SinkState {
    stream: Option<MediaStream>,
    position: Option<f64>,
    paused: bool,
}

/// Video sink with a manually driven playback clock.
#[derive(Clone, Default)]
pub struct MockVideoSink {
    state: Arc<Mutex<SinkState>>,
}

impl MockVideoSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the playback clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = state.position.as_mut() {
            *pos += secs;
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).paused = paused;
    }

    pub fn attached(&self) -> Option<MediaStream> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stream
            .clone()
    }
}

impl MediaSink for MockVideoSink {
    fn attach(&self, stream: &MediaStream) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stream = Some(stream.clone());
        state.position.get_or_insert(0.0);
    }

    fn detach(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stream = None;
        state.position = None;
    }

    fn playback_position(&self) -> Option<f64> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).position
    }

    fn is_paused(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).paused
    }
}
