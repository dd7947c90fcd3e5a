//! Push events and the router that applies them to a [`Workspace`]
//!
//! The transport (WebSocket or SSE) is not part of this crate; it delivers
//! frames shaped `{ "type", "conversation_id", "data" }` which deserialize
//! into [`AgentEvent`].
//!
//! Events addressed to a conversation that is not live are dropped, except
//! HITL and lifecycle events, which are conversation-independent. Completion
//! and error events always release the conversation's send lock.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::{EventError, StreamingError};
use crate::core::types::{LifecycleData, TimelineEvent, WorkPlan};
use crate::workspace::Workspace;

/// One push frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl AgentEvent {
    pub fn new(event_type: impl Into<String>, conversation_id: Option<&str>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            conversation_id: conversation_id.map(str::to_string),
            data,
        }
    }

    pub fn category(&self) -> EventCategory {
        EventCategory::of(&self.event_type)
    }

    /// Conversation named by the frame or by its payload
    pub fn target_conversation(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .or_else(|| self.data.get("conversation_id").and_then(Value::as_str))
    }
}

/// Routing class of an event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Lifecycle,
    Sandbox,
    Hitl,
    /// Streaming deltas, timeline and execution updates of the live conversation
    Conversation,
    Completion,
    Failure,
    Unknown,
}

impl EventCategory {
    pub fn of(event_type: &str) -> Self {
        match event_type {
            "lifecycle" | "lifecycle_state_changed" => Self::Lifecycle,
            "sandbox_connected" | "sandbox_disconnected" => Self::Sandbox,
            "complete" | "message_complete" => Self::Completion,
            "error" => Self::Failure,
            "message_start" | "text_delta" | "thought_delta" | "thought" | "work_plan"
            | "step_start" | "step_end" | "act" | "observe" | "user_message"
            | "assistant_message" => Self::Conversation,
            t if is_hitl_event(t) => Self::Hitl,
            _ => Self::Unknown,
        }
    }

    /// Whether the event only makes sense for the live conversation
    pub fn requires_live(&self) -> bool {
        matches!(self, Self::Conversation | Self::Completion | Self::Failure)
    }
}

pub fn is_hitl_event(event_type: &str) -> bool {
    event_type.ends_with("_asked")
        || event_type.ends_with("_answered")
        || matches!(
            event_type,
            "env_var_requested" | "env_var_provided" | "permission_replied"
        )
}

/// Result of routing one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Applied,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    workspace: Workspace,
}

impl EventRouter {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn route(&self, event: &AgentEvent) -> Result<Routed, EventError> {
        let category = event.category();
        let live = self.workspace.live_conversation_id();
        let target = event
            .target_conversation()
            .map(str::to_string)
            .or_else(|| live.clone());

        if matches!(category, EventCategory::Completion | EventCategory::Failure) {
            if let Some(target) = target.as_deref() {
                self.workspace.end_send(target);
            }
        }

        if category.requires_live() && (live.is_none() || target != live) {
            tracing::debug!(
                "Ignoring {} for non-live conversation {:?}",
                event.event_type,
                target
            );
            return Ok(Routed::Ignored);
        }

        match category {
            EventCategory::Lifecycle => {
                let data: LifecycleData = parse(&event.event_type, &event.data)?;
                self.workspace.set_lifecycle(data);
                Ok(Routed::Applied)
            }
            EventCategory::Sandbox => {
                let sandbox_id = if event.event_type == "sandbox_connected" {
                    Some(required::<String>(&event.event_type, &event.data, "sandbox_id")?)
                } else {
                    None
                };
                self.workspace.set_sandbox(sandbox_id);
                Ok(Routed::Applied)
            }
            EventCategory::Hitl => {
                let Some(conversation_id) = target else {
                    return Err(malformed(&event.event_type, "no conversation for HITL event"));
                };
                let applied = self.workspace.hitl.handle_hitl_event(
                    &event.event_type,
                    &event.data,
                    &conversation_id,
                )?;
                if applied && !self.workspace.is_live(&conversation_id) {
                    self.workspace.refresh_pending_hitl(&conversation_id);
                }
                Ok(if applied { Routed::Applied } else { Routed::Ignored })
            }
            EventCategory::Conversation => self.apply_conversation_event(event),
            EventCategory::Completion => {
                let content = optional::<String>(&event.data, "content");
                match self.workspace.streaming.complete(content) {
                    Ok(_) => {}
                    Err(StreamingError::NoStreamingInProgress) => {
                        tracing::debug!("Completion without an open stream");
                    }
                    Err(err) => return Err(err.into()),
                }
                Ok(Routed::Applied)
            }
            EventCategory::Failure => {
                let message = optional::<String>(&event.data, "message")
                    .unwrap_or_else(|| "Unknown error".to_string());
                self.workspace.streaming.fail(message);
                self.record_timeline(event);
                Ok(Routed::Applied)
            }
            EventCategory::Unknown => {
                tracing::debug!("Unhandled event type {}", event.event_type);
                Ok(Routed::Ignored)
            }
        }
    }

    fn apply_conversation_event(&self, event: &AgentEvent) -> Result<Routed, EventError> {
        let ws = &self.workspace;
        let event_type = event.event_type.as_str();
        let data = &event.data;

        match event_type {
            "message_start" => {
                if !ws.streaming.phase().is_active() {
                    ws.streaming.begin(optional(data, "message_id"))?;
                }
            }
            "text_delta" => {
                let delta: String = required(event_type, data, "delta")?;
                ws.streaming.append_text(&delta)?;
            }
            "thought_delta" => {
                let delta: String = required(event_type, data, "delta")?;
                ws.streaming.append_thinking(&delta)?;
            }
            "thought" => {
                let content: String = required(event_type, data, "content")?;
                ws.execution
                    .add_thought(&content, optional(data, "step_number"));
            }
            "work_plan" => {
                let plan: WorkPlan = match data.get("plan") {
                    Some(plan) => parse(event_type, plan)?,
                    None => parse(event_type, data)?,
                };
                ws.execution.set_work_plan(plan);
            }
            "step_start" => {
                let step_number: u32 = required(event_type, data, "step_number")?;
                let description: String = optional(data, "description").unwrap_or_default();
                ws.execution.start_step(step_number, &description);
            }
            "step_end" => {
                let step_number: u32 = required(event_type, data, "step_number")?;
                let success: bool = optional(data, "success").unwrap_or(true);
                let next_step_index: usize =
                    optional(data, "next_step_index").unwrap_or(step_number as usize);
                ws.execution.complete_step(step_number, success, next_step_index);
            }
            "act" => {
                let tool_name: String = required(event_type, data, "tool_name")?;
                let input = data.get("tool_input").cloned().unwrap_or(Value::Null);
                ws.execution.start_tool(
                    &tool_name,
                    input,
                    optional(data, "step_number"),
                    optional(data, "call_id"),
                    None,
                );
            }
            "observe" => {
                let observation: String = optional(data, "observation").unwrap_or_default();
                let call_id: Option<String> = optional(data, "call_id");
                ws.execution.complete_tool(
                    call_id.as_deref(),
                    &observation,
                    optional(data, "is_error"),
                );
            }
            _ => {}
        }

        self.record_timeline(event);
        Ok(Routed::Applied)
    }

    /// Frames carrying an event id are persisted timeline events
    fn record_timeline(&self, event: &AgentEvent) {
        let Value::Object(fields) = &event.data else {
            return;
        };
        if !fields.get("id").is_some_and(Value::is_string) {
            return;
        }
        let mut payload: Map<String, Value> = fields.clone();
        payload.insert("type".to_string(), Value::String(event.event_type.clone()));
        match serde_json::from_value::<TimelineEvent>(Value::Object(payload)) {
            Ok(timeline_event) => {
                if !self.workspace.timeline.add_timeline_event(timeline_event) {
                    tracing::debug!("Timeline rejected {} event", event.event_type);
                }
            }
            Err(e) => {
                tracing::debug!("{} frame is not a timeline event: {}", event.event_type, e);
            }
        }
    }
}

fn malformed(event_type: &str, reason: impl Into<String>) -> EventError {
    EventError::Malformed {
        event_type: event_type.to_string(),
        reason: reason.into(),
    }
}

fn parse<T: DeserializeOwned>(event_type: &str, value: &Value) -> Result<T, EventError> {
    serde_json::from_value(value.clone()).map_err(|e| malformed(event_type, e.to_string()))
}

fn required<T: DeserializeOwned>(event_type: &str, data: &Value, field: &str) -> Result<T, EventError> {
    match data.get(field) {
        Some(value) if !value.is_null() => parse(event_type, value),
        _ => Err(malformed(event_type, format!("missing field {}", field))),
    }
}

fn optional<T: DeserializeOwned>(data: &Value, field: &str) -> Option<T> {
    data.get(field)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
