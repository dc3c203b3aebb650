use super::*;

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;

use crate::config::{AvatarQuality, DisconnectAction, FetchPolicy};
use crate::credential::{CredentialFetcher, MockCredentialSource, StaticCredential};
use crate::error::TokenError;
use crate::sdk::mock::{MockAvatarSdk, MockCall, MockMicrophone, MockVideoSink};
use crate::sdk::{ConnectionQuality, SdkEvent};

struct Harness {
    sdk: MockAvatarSdk,
    mic: MockMicrophone,
    sink: MockVideoSink,
    controller: SessionController,
}

fn harness(policy: RecoveryPolicy) -> Harness {
    build(policy, MockAvatarSdk::new(), false)
}

/// Harness with a video sink bound, so the freeze detector runs.
fn harness_with_sink(policy: RecoveryPolicy) -> Harness {
    build(policy, MockAvatarSdk::new(), true)
}

fn build(policy: RecoveryPolicy, sdk: MockAvatarSdk, with_sink: bool) -> Harness {
    let mic = MockMicrophone::new();
    let sink = MockVideoSink::new();
    let mut builder = SessionController::builder(
        Arc::new(sdk.clone()),
        Arc::new(StaticCredential::new("tok")),
    )
    .microphone(Arc::new(mic.clone()))
    .policy(policy);
    if with_sink {
        builder = builder.sink(Arc::new(sink.clone()));
    }
    Harness {
        sdk,
        mic,
        sink,
        controller: builder.build().unwrap(),
    }
}

fn hard_policy() -> RecoveryPolicy {
    RecoveryPolicy {
        disconnect_action: DisconnectAction::Hard,
        ..RecoveryPolicy::default()
    }
}

async fn wait_until(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Let every spawned task run to its next timer.
async fn settle() {
    time::sleep(Duration::from_millis(10)).await;
}

fn starts(sdk: &MockAvatarSdk) -> usize {
    sdk.count(|c| matches!(c, MockCall::Start { .. }))
}

fn stops_of(sdk: &MockAvatarSdk, id: &str) -> usize {
    sdk.count(|c| matches!(c, MockCall::Stop { session } if session == id))
}

// ── Start / stop ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn start_connects_and_stop_is_idempotent() {
    let h = harness(RecoveryPolicy::default());
    assert_eq!(h.controller.state(), SessionState::Inactive);

    h.controller.start(false).await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(h.controller.counters().await, RetryCounts::default());

    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Inactive);
    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Inactive);
    assert_eq!(stops_of(&h.sdk, "mock-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_initialize_once() {
    let h = harness(RecoveryPolicy::default());
    let (a, b, c) = tokio::join!(
        h.controller.start(false),
        h.controller.start(false),
        h.controller.start(false)
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::Initialize { .. })), 1);

    // a start while connected is a no-op too
    h.controller.start(false).await.unwrap();
    assert_eq!(h.sdk.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn token_failure_surfaces_without_initialize() {
    let sdk = MockAvatarSdk::new();
    let mut credentials = MockCredentialSource::new();
    credentials
        .expect_fetch()
        .times(1)
        .returning(|| Err(TokenError::Status { status: 500 }));
    let controller = SessionController::builder(Arc::new(sdk.clone()), Arc::new(credentials))
        .build()
        .unwrap();

    let err = controller.start(false).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Token(TokenError::Status { status: 500 })
    ));
    assert_eq!(controller.state(), SessionState::Inactive);
    assert!(sdk.calls().is_empty());
}

#[tokio::test]
async fn proxy_errors_exhaust_fetch_before_any_initialize() {
    let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/api/get-access-token",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to retrieve access token")
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let fetcher = CredentialFetcher::new(
        format!("http://{}/api/get-access-token", addr),
        FetchPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(2),
        },
    );
    let sdk = MockAvatarSdk::new();
    let controller = SessionController::builder(Arc::new(sdk.clone()), Arc::new(fetcher))
        .build()
        .unwrap();

    let err = controller.start(false).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Token(TokenError::Status { status: 500 })
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(sdk.count(|c| matches!(c, MockCall::Initialize { .. })), 0);
    assert_eq!(controller.state(), SessionState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn start_rejection_releases_handle() {
    let h = harness(RecoveryPolicy::default());
    h.sdk.fail_start(1);

    let err = h.controller.start(false).await.unwrap_err();
    assert!(matches!(err, SessionError::Start(_)));
    assert_eq!(h.controller.state(), SessionState::Inactive);
    assert_eq!(stops_of(&h.sdk, "mock-1"), 1);

    h.controller.start(false).await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn ready_timeout_fails_start() {
    let policy = RecoveryPolicy {
        ready_timeout: Duration::from_secs(5),
        ..RecoveryPolicy::default()
    };
    let h = build(policy, MockAvatarSdk::new().with_auto_ready(false), false);

    let err = h.controller.start(false).await.unwrap_err();
    assert!(matches!(err, SessionError::ReadyTimeout(d) if d == Duration::from_secs(5)));
    assert_eq!(h.controller.state(), SessionState::Inactive);
    assert_eq!(stops_of(&h.sdk, "mock-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_ready_fails_start() {
    let h = build(
        RecoveryPolicy::default(),
        MockAvatarSdk::new().with_auto_ready(false),
        false,
    );
    let controller = Arc::new(h.controller);
    let pending = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(false).await })
    };
    settle().await;
    assert_eq!(controller.state(), SessionState::Connecting);

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Closed));
    assert_eq!(controller.state(), SessionState::Inactive);
    assert_eq!(h.sdk.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_during_start_cancels_it() {
    let h = build(
        RecoveryPolicy::default(),
        MockAvatarSdk::new().with_auto_ready(false),
        false,
    );
    let controller = Arc::new(h.controller);
    let pending = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(true).await })
    };
    settle().await;

    controller.stop().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Closed));
    assert_eq!(controller.state(), SessionState::Inactive);
    assert_eq!(h.mic.live_tracks(), 0);
    assert_eq!(stops_of(&h.sdk, "mock-1"), 1);
}

// ── Voice and microphone ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_releases_microphone() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();
    assert_eq!(h.mic.live_tracks(), 1);
    assert_eq!(
        h.sdk.count(|c| matches!(c, MockCall::StartVoiceChat { track: Some(t), .. } if t == "mic-1")),
        1
    );

    h.controller.stop().await;
    assert_eq!(h.mic.live_tracks(), 0);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::CloseVoiceChat { .. })), 1);

    h.controller.start(true).await.unwrap();
    assert_eq!(h.mic.live_tracks(), 1);
    h.controller.stop().await;
    assert_eq!(h.mic.live_tracks(), 0);
    assert_eq!(h.mic.total_acquired(), 2);
}

#[tokio::test(start_paused = true)]
async fn voice_failure_fails_start_and_releases() {
    let h = harness(RecoveryPolicy::default());
    h.sdk.fail_voice_chat(1);

    let err = h.controller.start(true).await.unwrap_err();
    assert!(matches!(err, SessionError::Voice(_)));
    assert_eq!(h.controller.state(), SessionState::Inactive);
    assert_eq!(h.mic.live_tracks(), 0);
    assert_eq!(stops_of(&h.sdk, "mock-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn microphone_denied_fails_start() {
    let h = harness(RecoveryPolicy::default());
    h.mic.fail_acquire(1);

    let err = h.controller.start(true).await.unwrap_err();
    assert!(matches!(err, SessionError::Voice(_)));
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::StartVoiceChat { .. })), 0);
    assert_eq!(h.controller.state(), SessionState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn soft_disconnect_reopens_voice_channel() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::CloseVoiceChat { .. })), 1);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::StartVoiceChat { .. })), 2);
    assert_eq!(h.mic.live_tracks(), 1);
    assert_eq!(h.mic.total_acquired(), 2);
}

#[tokio::test(start_paused = true)]
async fn stream_ready_after_soft_restart_clears_counters() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    settle().await;
    assert!(h.sdk.emit(SdkEvent::StreamReady {
        stream: MediaStream {
            id: "mock-1-stream".to_string(),
        },
    }));
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.controller.counters().await, RetryCounts::default());
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(h.mic.live_tracks(), 1);
}

#[tokio::test(start_paused = true)]
async fn soft_restart_without_voice_probes_handle() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::KeepAlive { .. })), 1);
    assert_eq!(h.sdk.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_soft_restart_after_disconnect_escalates() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();
    let mut state = h.controller.subscribe();

    h.sdk.fail_voice_chat(1);
    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Reconnecting).await;
    wait_until(&mut state, SessionState::Connected).await;
    settle().await;

    assert_eq!(h.sdk.sessions_created(), 2);
    assert_eq!(h.mic.live_tracks(), 1);
}

// ── Hard reset ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn hard_reset_recovers_and_resets_counters() {
    let h = harness(hard_policy());
    h.controller.start(false).await.unwrap();
    let mut state = h.controller.subscribe();

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Reconnecting).await;
    assert_eq!(h.controller.counters().await.reconnect_attempts, 1);
    wait_until(&mut state, SessionState::Connected).await;

    assert_eq!(h.sdk.sessions_created(), 2);
    assert_eq!(stops_of(&h.sdk, "mock-1"), 1);
    assert_eq!(h.controller.counters().await, RetryCounts::default());

    // the new handle answers pass-through calls
    h.controller.speak("hi", TaskType::Repeat).await.unwrap();
    assert_eq!(
        h.sdk.count(|c| matches!(c, MockCall::Speak { session, .. } if session == "mock-2")),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn hard_reset_restores_voice() {
    let h = harness(hard_policy());
    h.controller.start(true).await.unwrap();
    let mut state = h.controller.subscribe();

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Reconnecting).await;
    wait_until(&mut state, SessionState::Connected).await;
    settle().await;

    assert_eq!(h.mic.live_tracks(), 1);
    assert_eq!(
        h.sdk.count(|c| matches!(c, MockCall::StartVoiceChat { session, .. } if session == "mock-2")),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn hard_reset_gives_up_after_bounded_attempts() {
    let h = harness(hard_policy());
    h.controller.start(false).await.unwrap();
    let mut state = h.controller.subscribe();

    h.sdk.fail_start(3);
    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Failed).await;

    assert_eq!(starts(&h.sdk), 4);
    assert_eq!(h.controller.counters().await.reconnect_attempts, 3);

    // no fourth attempt, no automatic action afterwards
    time::sleep(Duration::from_secs(600)).await;
    assert_eq!(starts(&h.sdk), 4);
    assert_eq!(h.controller.state(), SessionState::Failed);

    // a manual start is allowed again
    h.controller.start(false).await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.controller.counters().await, RetryCounts::default());
}

#[tokio::test(start_paused = true)]
async fn hard_reset_backs_off_between_attempts() {
    let policy = RecoveryPolicy {
        settle_delay: Duration::from_secs(1),
        backoff_base: Duration::from_secs(2),
        ..hard_policy()
    };
    let h = harness(policy);
    h.controller.start(false).await.unwrap();

    h.sdk.fail_start(2);
    let began = time::Instant::now();
    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    let mut state = h.controller.subscribe();
    wait_until(&mut state, SessionState::Reconnecting).await;
    wait_until(&mut state, SessionState::Connected).await;

    // attempt 1: settle; attempt 2: backoff 2s + settle; attempt 3: 4s + settle
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_secs(10));
    assert_eq!(starts(&h.sdk), 4);
}

#[tokio::test(start_paused = true)]
async fn already_active_forces_stop_and_retries() {
    let h = harness(hard_policy());
    h.controller.start(false).await.unwrap();
    let mut state = h.controller.subscribe();

    h.sdk.fail_start_already_active(1);
    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Reconnecting).await;
    wait_until(&mut state, SessionState::Connected).await;

    // released once, then force-stopped once more
    assert_eq!(stops_of(&h.sdk, "mock-1"), 2);
    assert_eq!(h.sdk.sessions_created(), 3);
    assert_eq!(h.controller.counters().await, RetryCounts::default());
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_recovery() {
    let h = harness(hard_policy());
    h.controller.start(false).await.unwrap();
    let mut state = h.controller.subscribe();

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Reconnecting).await;
    h.controller.stop().await;
    assert_eq!(h.controller.state(), SessionState::Inactive);

    time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.controller.state(), SessionState::Inactive);
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(starts(&h.sdk), 1);
}

#[tokio::test(start_paused = true)]
async fn poor_connection_lowers_quality_of_next_reset() {
    let h = harness(hard_policy());
    h.controller.start(false).await.unwrap();
    let mut state = h.controller.subscribe();

    assert!(h.sdk.emit(SdkEvent::ConnectionQualityChanged {
        quality: ConnectionQuality::Bad
    }));
    settle().await;
    assert_eq!(h.controller.state(), SessionState::Connected);

    assert!(h.sdk.emit(SdkEvent::StreamDisconnected));
    wait_until(&mut state, SessionState::Reconnecting).await;
    wait_until(&mut state, SessionState::Connected).await;

    let qualities: Vec<AvatarQuality> = h
        .sdk
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            MockCall::Start { quality, .. } => Some(quality),
            _ => None,
        })
        .collect();
    assert_eq!(qualities, vec![AvatarQuality::High, AvatarQuality::Medium]);
}

// ── Freeze detection ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn frozen_video_triggers_soft_restart() {
    let h = harness_with_sink(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();
    assert!(h.sink.attached().is_some());

    // polls at 5s (baseline), 10s (stall 1), 15s (stall 2: soft restart)
    time::sleep(Duration::from_secs(16)).await;
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::CloseVoiceChat { .. })), 1);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::StartVoiceChat { .. })), 2);
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(h.mic.live_tracks(), 1);
    assert_eq!(h.controller.counters().await.freeze_detections, 2);
}

#[tokio::test(start_paused = true)]
async fn persistent_freeze_escalates_to_hard_reset() {
    let h = harness_with_sink(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();

    // soft restart at 15s, still frozen at 20s, reset ready at 21s
    time::sleep(Duration::from_secs(23)).await;
    assert_eq!(h.sdk.sessions_created(), 2);
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(h.controller.counters().await, RetryCounts::default());
    assert_eq!(h.mic.live_tracks(), 1);
}

#[tokio::test(start_paused = true)]
async fn advancing_video_is_left_alone() {
    let h = harness_with_sink(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();

    time::sleep(Duration::from_millis(2500)).await;
    for _ in 0..10 {
        h.sink.advance(1.0);
        time::sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(h.controller.counters().await.freeze_detections, 0);
    assert_eq!(h.sdk.sessions_created(), 1);
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::KeepAlive { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn paused_video_is_not_a_freeze() {
    let h = harness_with_sink(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();
    h.sink.set_paused(true);

    time::sleep(Duration::from_secs(50)).await;
    assert_eq!(h.controller.counters().await.freeze_detections, 0);
    assert_eq!(h.sdk.sessions_created(), 1);
}

// ── Keep-alive ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn keep_alive_runs_only_while_session_lives() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();

    time::sleep(Duration::from_secs(125)).await;
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::KeepAlive { .. })), 2);

    h.controller.stop().await;
    time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::KeepAlive { .. })), 2);
}

// ── Utterance gate ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn gate_forwards_only_triggered_turns() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();

    assert!(h.sdk.emit_turn(&["в", " лобстер"]));
    assert!(h.sdk.emit_turn(&["привет"]));
    settle().await;

    let speaks: Vec<(String, TaskType)> = h
        .sdk
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            MockCall::Speak {
                text, task_type, ..
            } => Some((text, task_type)),
            _ => None,
        })
        .collect();
    assert_eq!(
        speaks,
        vec![
            ("в лобстер".to_string(), TaskType::Talk),
            (String::new(), TaskType::Repeat),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn disabled_gate_leaves_transcripts_alone() {
    let sdk = MockAvatarSdk::new();
    let controller = SessionController::builder(
        Arc::new(sdk.clone()),
        Arc::new(StaticCredential::new("tok")),
    )
    .gate(GateConfig {
        enabled: false,
        ..GateConfig::default()
    })
    .build()
    .unwrap();
    controller.start(false).await.unwrap();

    assert!(sdk.emit_turn(&["в", " лобстер"]));
    assert!(sdk.emit_turn(&["привет"]));
    settle().await;

    assert_eq!(sdk.count(|c| matches!(c, MockCall::Speak { .. })), 0);
    assert_eq!(sdk.count(|c| matches!(c, MockCall::Interrupt { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn gate_dispatch_failure_does_not_affect_next_turn() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();

    h.sdk.fail_speak(1);
    assert!(h.sdk.emit_turn(&["lobster, one"]));
    assert!(h.sdk.emit_turn(&["lobster, two"]));
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert_eq!(
        h.sdk.count(|c| matches!(c, MockCall::Speak { text, .. } if text == "lobster, two")),
        1
    );
}

// ── Pass-through and draft ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pass_through_requires_connected_session() {
    let h = harness(RecoveryPolicy::default());
    assert!(matches!(
        h.controller.speak("hi", TaskType::Talk).await,
        Err(SessionError::NotReady)
    ));
    assert!(matches!(
        h.controller.start_listening().await,
        Err(SessionError::NotReady)
    ));

    h.controller.start(false).await.unwrap();
    h.controller.speak("hi", TaskType::Talk).await.unwrap();
    h.controller.start_listening().await.unwrap();
    h.controller.mute_input().await.unwrap();
    h.controller.unmute_input().await.unwrap();
    h.controller.stop_listening().await.unwrap();
    h.controller.interrupt().await.unwrap();
    assert_eq!(h.sdk.count(|c| matches!(c, MockCall::StartListening { .. })), 1);

    h.controller.stop().await;
    assert!(matches!(
        h.controller.interrupt().await,
        Err(SessionError::NotReady)
    ));
}

#[tokio::test(start_paused = true)]
async fn running_session_keeps_its_config_snapshot() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();

    h.controller
        .update_draft(|draft| draft.quality = AvatarQuality::Low);
    assert_eq!(h.controller.draft().quality, AvatarQuality::Low);
    let active = h.controller.active_config().await.unwrap();
    assert_eq!(active.quality, AvatarQuality::High);

    h.controller.stop().await;
    h.controller.start(false).await.unwrap();
    assert_eq!(
        h.sdk.count(|c| matches!(c, MockCall::Start { quality: AvatarQuality::Low, .. })),
        1
    );
}

// ── Teardown ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn events_after_stop_are_dropped() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(false).await.unwrap();
    h.controller.stop().await;
    settle().await;

    h.sdk.emit(SdkEvent::StreamReady {
        stream: MediaStream {
            id: "late".to_string(),
        },
    });
    h.sdk.emit(SdkEvent::StreamDisconnected);
    settle().await;
    assert_eq!(h.controller.state(), SessionState::Inactive);
    assert_eq!(h.sdk.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_controller_releases_session() {
    let h = harness(RecoveryPolicy::default());
    h.controller.start(true).await.unwrap();
    let sdk = h.sdk.clone();
    let mic = h.mic.clone();

    drop(h);
    settle().await;

    assert_eq!(mic.live_tracks(), 0);
    assert_eq!(stops_of(&sdk, "mock-1"), 1);
    time::sleep(Duration::from_secs(300)).await;
    assert_eq!(sdk.count(|c| matches!(c, MockCall::KeepAlive { .. })), 0);
}
