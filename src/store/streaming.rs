//! Streaming Store - typewriter draft of the response being streamed
//!
//! Phase machine: Idle -> Connecting -> Streaming -> Completed | Error.
//! Completed and Error may start a new stream; `reset` always returns to Idle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::core::errors::StreamingError;

/// Connection phase of the current response stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingPhase {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Completed,
    Error,
}

impl StreamingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Whether a response is in flight
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingState {
    pub phase: StreamingPhase,
    /// Accumulated assistant text
    pub draft: String,
    /// Accumulated reasoning text
    pub thinking: String,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Observable streaming state for the live conversation
#[derive(Debug, Clone)]
pub struct StreamingStore {
    store: Store<StreamingState>,
}

impl Default for StreamingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingStore {
    pub fn new() -> Self {
        Self {
            store: Store::new("streaming", StreamingState::default()),
        }
    }

    pub fn store(&self) -> &Store<StreamingState> {
        &self.store
    }

    pub fn state(&self) -> StreamingState {
        self.store.get_state()
    }

    pub fn phase(&self) -> StreamingPhase {
        self.store.with_state(|s| s.phase)
    }

    pub fn draft(&self) -> String {
        self.store.with_state(|s| s.draft.clone())
    }

    /// A send was issued; waiting for the first byte
    pub fn begin(&self, message_id: Option<String>) -> Result<(), StreamingError> {
        self.store.set_state(|s| {
            transition(s, StreamingPhase::Connecting)?;
            s.draft.clear();
            s.thinking.clear();
            s.error = None;
            s.message_id = message_id;
            s.started_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Append a text delta, opening the stream if no start was observed
    pub fn append_text(&self, delta: &str) -> Result<(), StreamingError> {
        self.store.set_state(|s| {
            open_for_delta(s)?;
            s.draft.push_str(delta);
            Ok(())
        })
    }

    /// Append a reasoning delta
    pub fn append_thinking(&self, delta: &str) -> Result<(), StreamingError> {
        self.store.set_state(|s| {
            open_for_delta(s)?;
            s.thinking.push_str(delta);
            Ok(())
        })
    }

    /// Finish the stream and return the final text
    ///
    /// `final_content` replaces the accumulated draft when the server sends the
    /// full text with its completion event.
    pub fn complete(&self, final_content: Option<String>) -> Result<String, StreamingError> {
        self.store.set_state(|s| {
            if !s.phase.is_active() {
                return Err(StreamingError::NoStreamingInProgress);
            }
            if let Some(content) = final_content {
                s.draft = content;
            }
            transition(s, StreamingPhase::Completed)?;
            Ok(s.draft.clone())
        })
    }

    /// Record a stream failure; the partial draft is kept for display
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("Streaming failed: {}", message);
        self.store.set_state(|s| {
            s.phase = StreamingPhase::Error;
            s.error = Some(message);
        });
    }

    pub fn reset(&self) {
        self.store.replace(StreamingState::default());
    }

    pub fn snapshot(&self) -> StreamingState {
        self.store.get_state()
    }

    pub fn restore(&self, state: StreamingState) {
        self.store.replace(state);
    }

    pub(crate) fn restore_quiet(&self, state: StreamingState) {
        self.store.set_state_quiet(|s| *s = state);
    }
}

fn open_for_delta(s: &mut StreamingState) -> Result<(), StreamingError> {
    match s.phase {
        StreamingPhase::Streaming => Ok(()),
        StreamingPhase::Connecting => transition(s, StreamingPhase::Streaming),
        StreamingPhase::Idle | StreamingPhase::Completed | StreamingPhase::Error => {
            s.draft.clear();
            s.thinking.clear();
            s.error = None;
            s.started_at = Some(Utc::now());
            transition(s, StreamingPhase::Streaming)
        }
    }
}

fn transition(s: &mut StreamingState, to: StreamingPhase) -> Result<(), StreamingError> {
    use StreamingPhase::*;

    let valid = matches!(
        (s.phase, to),
        (Idle, Connecting)
            | (Idle, Streaming)
            | (Connecting, Streaming)
            | (Connecting, Completed)
            | (Streaming, Completed)
            | (Completed, Connecting)
            | (Completed, Streaming)
            | (Error, Connecting)
            | (Error, Streaming)
    );
    if !valid {
        return Err(StreamingError::InvalidStateTransition {
            from: s.phase.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    tracing::debug!("streaming: {} -> {}", s.phase.as_str(), to.as_str());
    s.phase = to;
    Ok(())
}
