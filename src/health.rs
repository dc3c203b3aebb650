//! Health monitor: freeze detection over the video sink's playback clock.
//!
//! Disconnect and connection-quality signals arrive as SDK events and are
//! classified in the session event loop; the freeze detector runs as its own
//! poller and reports playback progress into the same loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::sdk::MediaSink;
use crate::session::SessionState;

/// Faults recovered automatically and not surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientFault {
    /// Playback clock stopped moving.
    Freeze,
    /// The SDK reported the stream as disconnected.
    Disconnect,
    /// The SDK reported poor connection quality.
    PoorConnection,
}

/// One reading of the video sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSample {
    pub position: Option<f64>,
    pub paused: bool,
    pub connected: bool,
}

/// Result of comparing a sample with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackProgress {
    Advanced,
    Stalled,
    /// Paused, not connected, or nothing bound; baseline cleared.
    Skipped,
}

/// Compares consecutive playback positions.
#[derive(Debug, Default)]
pub struct FreezeDetector {
    last_position: Option<f64>,
}

impl FreezeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: PlaybackSample) -> PlaybackProgress {
        let position = match sample.position {
            Some(p) if sample.connected && !sample.paused => p,
            _ => {
                self.last_position = None;
                return PlaybackProgress::Skipped;
            }
        };

        let progress = match self.last_position {
            Some(last) if (position - last).abs() < f64::EPSILON => PlaybackProgress::Stalled,
            // First sample only sets the baseline.
            None => PlaybackProgress::Skipped,
            Some(_) => PlaybackProgress::Advanced,
        };
        self.last_position = Some(position);
        progress
    }
}

fn sample(sink: &dyn MediaSink, state: &watch::Receiver<SessionState>) -> PlaybackSample {
    PlaybackSample {
        position: sink.playback_position(),
        paused: sink.is_paused(),
        connected: *state.borrow() == SessionState::Connected,
    }
}

/// Poll `sink` every `interval` and report progress on `tx` until
/// `cancel` fires or the receiver goes away. Skipped polls are not reported.
pub fn spawn_freeze_poller(
    sink: Arc<dyn MediaSink>,
    interval: Duration,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<PlaybackProgress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut detector = FreezeDetector::new();
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let progress = detector.observe(sample(sink.as_ref(), &state));
                    trace!(?progress, "Playback poll");
                    if progress != PlaybackProgress::Skipped && tx.send(progress).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Freeze poller stopped");
    })
}
