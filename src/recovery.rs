//! Recovery policy: retry counters, reconnect backoff and tier selection.
//!
//! The controller in [`crate::session`] executes the tiers; this module only
//! decides when and how far to escalate.

use std::time::Duration;

use crate::config::{DisconnectAction, RecoveryPolicy};
use crate::health::TransientFault;

/// Recovery tier, from cheapest to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTier {
    /// Restart only the voice/media sub-channel, keeping the session handle.
    Soft,
    /// Tear the session down and build a new one.
    Hard,
}

/// Tier to request for `fault`, if any.
pub fn tier_for(fault: TransientFault, policy: &RecoveryPolicy) -> Option<RecoveryTier> {
    match fault {
        TransientFault::Disconnect => Some(match policy.disconnect_action {
            DisconnectAction::Soft => RecoveryTier::Soft,
            DisconnectAction::Hard => RecoveryTier::Hard,
        }),
        TransientFault::Freeze => Some(RecoveryTier::Soft),
        TransientFault::PoorConnection => None,
    }
}

/// Outcome of recording one stalled playback poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// Below the threshold; keep watching.
    Watching(u32),
    /// Threshold reached: request a soft restart.
    SoftRestart,
    /// Still stalled after a soft restart at the threshold: hard reset.
    Escalate,
}

/// Point-in-time copy of the retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounts {
    pub reconnect_attempts: u32,
    pub freeze_detections: u32,
}

/// Bounded reconnect and freeze counters.
#[derive(Debug, Clone)]
pub struct RetryCounters {
    reconnect_attempts: u32,
    freeze_detections: u32,
    max_reconnect_attempts: u32,
    max_freeze_detections: u32,
    soft_restarted_at_max: bool,
}

impl RetryCounters {
    pub fn new(policy: &RecoveryPolicy) -> Self {
        Self {
            reconnect_attempts: 0,
            freeze_detections: 0,
            max_reconnect_attempts: policy.max_reconnect_attempts,
            max_freeze_detections: policy.max_freeze_detections.max(1),
            soft_restarted_at_max: false,
        }
    }

    pub fn snapshot(&self) -> RetryCounts {
        RetryCounts {
            reconnect_attempts: self.reconnect_attempts,
            freeze_detections: self.freeze_detections,
        }
    }

    /// Confirmed healthy stream: both counters back to zero.
    pub fn reset(&mut self) {
        self.reconnect_attempts = 0;
        self.record_progress();
    }

    /// Playback clock moved.
    pub fn record_progress(&mut self) {
        self.freeze_detections = 0;
        self.soft_restarted_at_max = false;
    }

    /// Playback clock did not move since the previous poll. The counter
    /// saturates at its max.
    pub fn record_stall(&mut self) -> StallVerdict {
        if self.freeze_detections < self.max_freeze_detections {
            self.freeze_detections += 1;
        }
        if self.freeze_detections < self.max_freeze_detections {
            StallVerdict::Watching(self.freeze_detections)
        } else if self.soft_restarted_at_max {
            StallVerdict::Escalate
        } else {
            self.soft_restarted_at_max = true;
            StallVerdict::SoftRestart
        }
    }

    pub fn freeze_exhausted(&self) -> bool {
        self.freeze_detections >= self.max_freeze_detections
    }

    /// Claim the next reconnect attempt. Returns the 1-based attempt number,
    /// or `None` once the bound is reached.
    pub fn begin_reconnect_attempt(&mut self) -> Option<u32> {
        if self.reconnect_attempts >= self.max_reconnect_attempts {
            return None;
        }
        self.reconnect_attempts += 1;
        Some(self.reconnect_attempts)
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }
}

/// Should a failed soft restart escalate to a hard reset?
pub fn should_escalate(fault: TransientFault, counters: &RetryCounters) -> bool {
    fault == TransientFault::Disconnect || counters.freeze_exhausted()
}

/// Exponential backoff for scheduled reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base.min(cap),
        }
    }

    pub fn from_policy(policy: &RecoveryPolicy) -> Self {
        Self::new(policy.backoff_base, policy.backoff_cap)
    }

    /// Current delay; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base.min(self.cap);
    }
}
