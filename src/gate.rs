//! Utterance gate.
//!
//! Buffers streamed transcript fragments for the single active user turn
//! and, when the turn ends, decides whether the utterance reaches the
//! avatar. Only utterances containing a trigger phrase are forwarded;
//! everything else is suppressed so the avatar stays silent.

use regex::Regex;
use tracing::{debug, info};

use crate::config::{GateConfig, TaskType};
use crate::error::GateDispatchError;
use crate::sdk::{AvatarHandle, SpeakRequest};

/// Identifier of one user turn within a session.
pub type TurnId = u64;

/// Longest utterance preview written to the log.
const LOG_PREVIEW_CHARS: usize = 80;

// ── Trigger predicate ────────────────────────────────────────────

/// Case-insensitive trigger-phrase matcher.
///
/// A phrase made of several words also matches with the internal spaces
/// removed ("hey bot" matches "heybot"), and runs of whitespace in the
/// input are treated as a single space.
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    pattern: Option<Regex>,
}

impl TriggerMatcher {
    pub fn new(words: &[String]) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = words
            .iter()
            .filter_map(|word| {
                let tokens: Vec<String> = word
                    .split_whitespace()
                    .map(|t| regex::escape(&t.to_lowercase()))
                    .collect();
                (!tokens.is_empty()).then(|| tokens.join(r"\s*"))
            })
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }

        let pattern = Regex::new(&format!("(?i)(?:{})", alternatives.join("|")))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        let Some(pattern) = &self.pattern else {
            return false;
        };
        pattern.is_match(&normalize(text))
    }
}

/// Lowercase and collapse whitespace.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    if text.chars().count() > LOG_PREVIEW_CHARS {
        out.push('…');
    }
    out
}

// ── Gate ─────────────────────────────────────────────────────────

/// What to do with a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Forward the utterance to the avatar.
    Forward { turn: TurnId, text: String },
    /// Keep the avatar from responding.
    Suppress { turn: TurnId },
    /// Nothing was said (or the gate is disabled).
    Ignore,
}

#[derive(Debug)]
struct Turn {
    id: TurnId,
    buffer: String,
}

/// Per-session utterance buffer and trigger policy.
pub struct UtteranceGate {
    config: GateConfig,
    matcher: TriggerMatcher,
    current: Option<Turn>,
    next_turn: TurnId,
}

impl UtteranceGate {
    pub fn new(config: GateConfig) -> Result<Self, regex::Error> {
        let matcher = TriggerMatcher::new(&config.trigger_words)?;
        Ok(Self::with_matcher(config, matcher))
    }

    /// Build a gate around an already compiled matcher.
    pub fn with_matcher(config: GateConfig, matcher: TriggerMatcher) -> Self {
        Self {
            config,
            matcher,
            current: None,
            next_turn: 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Open a new turn with an empty buffer. An unfinished previous turn is
    /// discarded.
    pub fn begin_turn(&mut self) -> TurnId {
        let id = self.next_turn;
        self.next_turn += 1;
        if let Some(stale) = self.current.replace(Turn {
            id,
            buffer: String::new(),
        }) {
            debug!(turn = stale.id, "Discarding unfinished turn");
        }
        id
    }

    pub fn current_turn(&self) -> Option<TurnId> {
        self.current.as_ref().map(|t| t.id)
    }

    /// Append a fragment to `turn`. Fragments for any other turn are dropped.
    pub fn append(&mut self, turn: TurnId, fragment: &str) -> bool {
        match self.current.as_mut() {
            Some(current) if current.id == turn => {
                current.buffer.push_str(fragment);
                true
            }
            _ => {
                debug!(turn, "Dropping fragment for inactive turn");
                false
            }
        }
    }

    /// Append to the open turn, opening one if none is open.
    pub fn append_current(&mut self, fragment: &str) -> TurnId {
        let turn = match self.current_turn() {
            Some(turn) => turn,
            None => self.begin_turn(),
        };
        self.append(turn, fragment);
        turn
    }

    /// Buffered text of the open turn.
    pub fn buffered(&self) -> &str {
        self.current.as_ref().map_or("", |t| t.buffer.as_str())
    }

    /// Close the open turn and decide its fate. The buffer is cleared
    /// whatever the outcome.
    pub fn end_turn(&mut self) -> GateDecision {
        let Some(turn) = self.current.take() else {
            return GateDecision::Ignore;
        };
        let text = turn.buffer.trim();
        if !self.config.enabled || text.is_empty() {
            return GateDecision::Ignore;
        }

        if self.matcher.matches(text) {
            info!(turn = turn.id, text = %preview(text), "Trigger matched, forwarding utterance");
            GateDecision::Forward {
                turn: turn.id,
                text: text.to_string(),
            }
        } else {
            debug!(turn = turn.id, text = %preview(text), "No trigger, suppressing utterance");
            GateDecision::Suppress { turn: turn.id }
        }
    }

}

/// Carry out a gate decision against `handle`. Runs outside the session
/// lock, so it takes the gate's config rather than the gate.
pub async fn dispatch(
    config: &GateConfig,
    handle: &dyn AvatarHandle,
    decision: GateDecision,
) -> Result<(), GateDispatchError> {
    match decision {
        GateDecision::Ignore => Ok(()),
        GateDecision::Forward { turn, text } => handle
            .speak(SpeakRequest {
                text,
                task_type: config.task_type,
            })
            .await
            .map_err(|source| GateDispatchError { turn, source }),
        GateDecision::Suppress { turn } => {
            if config.interrupt_on_suppress {
                handle
                    .interrupt()
                    .await
                    .map_err(|source| GateDispatchError { turn, source })?;
            }
            if config.placeholder {
                handle
                    .speak(SpeakRequest {
                        text: String::new(),
                        task_type: TaskType::Repeat,
                    })
                    .await
                    .map_err(|source| GateDispatchError { turn, source })?;
            }
            Ok(())
        }
    }
}
