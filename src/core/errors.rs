//! Domain error types
//!
//! Collaborator failures arrive as [`ServiceError`]; each store wraps them in
//! its own error type so the UI layer can match on what went wrong.

use thiserror::Error;

/// Failure reported by a request/response collaborator
///
/// Mirrors the shape of an HTTP client error: an optional status, an optional
/// nested `response.data.detail` string and the transport-level message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}", self.display_message())]
pub struct ServiceError {
    pub status: Option<u16>,
    pub detail: Option<String>,
    pub message: String,
}

impl ServiceError {
    /// Error carrying only a transport message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            detail: None,
            message: message.into(),
        }
    }

    /// Error carrying a server-provided detail string
    pub fn with_detail(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            detail: Some(detail.into()),
            message: format!("Request failed with status code {}", status),
        }
    }

    /// Message for display: nested detail, then message, then `fallback`
    pub fn message_or(&self, fallback: &str) -> String {
        if let Some(detail) = self.detail.as_deref().filter(|d| !d.trim().is_empty()) {
            return detail.to_string();
        }
        if !self.message.trim().is_empty() {
            return self.message.clone();
        }
        fallback.to_string()
    }

    fn display_message(&self) -> String {
        self.message_or("Unknown service error")
    }
}

/// Errors from the timeline store
#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("Failed to load timeline: {0}")]
    Load(#[source] ServiceError),

    #[error("Failed to load earlier messages: {0}")]
    LoadEarlier(#[source] ServiceError),
}

/// Errors from the streaming store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamingError {
    /// Invalid streaming state transition
    #[error("Invalid streaming state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// No streaming in progress
    #[error("No streaming in progress")]
    NoStreamingInProgress,
}

/// Errors from the plan-mode store
#[derive(Debug, Error)]
pub enum PlanModeError {
    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("No plan is loaded")]
    NoPlan,
}

/// Errors from the conversations store
#[derive(Debug, Error)]
pub enum ConversationStoreError {
    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("Conversation not found: {0}")]
    NotFound(String),
}

/// Errors from the HITL store
#[derive(Debug, Error)]
pub enum HitlError {
    #[error("HITL request not found: {0}")]
    RequestNotFound(String),

    #[error("HITL request {0} is no longer pending")]
    NotPending(String),

    #[error("Timeout checker is already running")]
    CheckerAlreadyRunning,

    #[error("Malformed {event_type} payload: {reason}")]
    MalformedEvent { event_type: String, reason: String },

    #[error("Failed to submit response: {0}")]
    Submit(#[source] ServiceError),
}

/// Errors from conversation switching and send locking
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwitchError {
    #[error("Conversation {0} already has a message in flight")]
    SendInFlight(String),

    #[error("Conversation {0} is already live")]
    AlreadyLive(String),
}

/// Errors from routing a push event into the stores
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Malformed {event_type} event: {reason}")]
    Malformed { event_type: String, reason: String },

    #[error(transparent)]
    Hitl(#[from] HitlError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),
}
