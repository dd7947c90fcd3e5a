//! Canonical type definitions for the conversation state layer
//!
//! This module is the single source of truth for types shared by the stores,
//! the event router and the snapshot model. Wire names are snake_case so the
//! types deserialize directly from server payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ========== Agent modes ==========

/// Agent operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Build mode: full access to read, write and execute
    #[default]
    Build,
    /// Plan mode: read + draft a plan document, no execution
    Plan,
    /// Explore mode: read-only investigation
    Explore,
}

impl AgentMode {
    /// Get the next mode in the cycle (Build → Plan → Explore → Build)
    pub fn next(self) -> Self {
        match self {
            Self::Build => Self::Plan,
            Self::Plan => Self::Explore,
            Self::Explore => Self::Build,
        }
    }
}

impl std::str::FromStr for AgentMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "plan" => Self::Plan,
            "explore" => Self::Explore,
            _ => Self::Build,
        })
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Plan => write!(f, "plan"),
            Self::Explore => write!(f, "explore"),
        }
    }
}

// ========== Timeline ==========

/// One entry of a conversation's unified event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    /// Ordering key and pagination cursor. `0` means "not assigned yet".
    #[serde(default)]
    pub sequence_number: i64,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: TimelineEventKind,
}

impl TimelineEvent {
    /// Create an event without a sequence number; the timeline assigns one on append
    pub fn new(id: impl Into<String>, kind: TimelineEventKind) -> Self {
        Self {
            id: id.into(),
            sequence_number: 0,
            timestamp: Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn with_sequence(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// Variant tag as it appears on the wire
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// Variant payloads of [`TimelineEvent`], tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEventKind {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    Thought {
        content: String,
    },
    Act {
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
        #[serde(default)]
        call_id: Option<String>,
    },
    Observe {
        tool_name: String,
        #[serde(default)]
        observation: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        call_id: Option<String>,
    },
    WorkPlan {
        #[serde(default)]
        steps: Vec<PlanStep>,
    },
    StepStart {
        step_number: u32,
        #[serde(default)]
        description: String,
    },
    StepEnd {
        step_number: u32,
        #[serde(default)]
        success: bool,
    },
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    HitlRequest {
        request_id: String,
        #[serde(default)]
        request_type: String,
    },
    Error {
        message: String,
    },
    /// Event types this client does not know yet
    #[serde(other)]
    Unknown,
}

impl TimelineEventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::Thought { .. } => "thought",
            Self::Act { .. } => "act",
            Self::Observe { .. } => "observe",
            Self::WorkPlan { .. } => "work_plan",
            Self::StepStart { .. } => "step_start",
            Self::StepEnd { .. } => "step_end",
            Self::TextDelta { .. } => "text_delta",
            Self::HitlRequest { .. } => "hitl_request",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// One page of timeline events as returned by the conversation-message service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelinePage {
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub first_sequence: Option<i64>,
    #[serde(default)]
    pub last_sequence: Option<i64>,
}

// ========== Work plan / execution ==========

/// A single step of a work plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    pub description: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub expected_output: String,
}

impl PlanStep {
    pub fn new(step_number: u32, description: impl Into<String>) -> Self {
        Self {
            step_number,
            description: description.into(),
            required_tools: Vec::new(),
            dependencies: Vec::new(),
            expected_output: String::new(),
        }
    }
}

/// Overall status of a work plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkPlanStatus {
    #[default]
    Planning,
    InProgress,
    Completed,
    Failed,
}

/// Ordered list of steps the agent executes for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPlan {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default)]
    pub status: WorkPlanStatus,
}

impl WorkPlan {
    pub fn new(id: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: id.into(),
            conversation_id: String::new(),
            steps,
            current_step_index: 0,
            status: WorkPlanStatus::Planning,
        }
    }
}

/// Status of one execution step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status of a tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Tool is currently executing
    Running,
    /// Tool completed successfully
    Success,
    /// Tool failed with an error
    Failed,
}

/// One tool call, tracked both in the global history and under its step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Owning step, if the call was announced under one
    #[serde(default)]
    pub step_number: Option<u32>,
}

/// Execution record derived 1:1 from a work plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTimelineStep {
    pub step_number: u32,
    pub description: String,
    pub status: StepStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub thoughts: Vec<String>,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
}

impl ExecutionTimelineStep {
    pub fn from_plan_step(step: &PlanStep) -> Self {
        Self {
            step_number: step.step_number,
            description: step.description.clone(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            thoughts: Vec::new(),
            tool_executions: Vec::new(),
        }
    }
}

// ========== Plan documents ==========

/// Review status of a plan document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanDocumentStatus {
    #[default]
    Draft,
    Reviewing,
    Approved,
    Rejected,
}

/// Plan document authored in plan mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    pub id: String,
    pub conversation_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: PlanDocumentStatus,
    #[serde(default)]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller may change on a plan document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Plan-mode status of a conversation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanModeStatus {
    #[serde(default)]
    pub is_in_plan_mode: bool,
    #[serde(default)]
    pub current_mode: AgentMode,
    #[serde(default)]
    pub current_plan_id: Option<String>,
    #[serde(default)]
    pub plan: Option<PlanDocument>,
}

// ========== Conversations ==========

/// Conversation summary as listed by the conversation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// ========== Human-in-the-loop ==========

/// Lifecycle of a HITL request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    Pending,
    Answered,
    Timeout,
}

/// Option presented by a clarification or decision request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommended: bool,
}

/// Environment variable requested from the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarField {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

/// Kind-specific payload of a HITL request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HitlRequestKind {
    Clarification {
        question: String,
        #[serde(default)]
        options: Vec<HitlOption>,
        #[serde(default)]
        allow_custom: bool,
    },
    Permission {
        tool_name: String,
        #[serde(default)]
        action: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        risk_level: String,
    },
    Decision {
        question: String,
        #[serde(default)]
        options: Vec<HitlOption>,
        #[serde(default)]
        default_option: Option<String>,
    },
    EnvVar {
        tool_name: String,
        #[serde(default)]
        fields: Vec<EnvVarField>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl HitlRequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Clarification { .. } => "clarification",
            Self::Permission { .. } => "permission",
            Self::Decision { .. } => "decision",
            Self::EnvVar { .. } => "env_var",
        }
    }
}

/// A request that pauses automated execution pending a user answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    pub request_id: String,
    pub conversation_id: String,
    #[serde(flatten)]
    pub kind: HitlRequestKind,
    pub status: HitlStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response: Option<Value>,
}

impl HitlRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == HitlStatus::Pending && self.timeout_at < now
    }
}

// ========== Lifecycle ==========

/// Coarse operational phase of the agent runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Paused,
    Error,
    ShuttingDown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Lifecycle payload delivered by the push subscription
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LifecycleData {
    /// Explicit state reported by the server, when present
    #[serde(default)]
    pub lifecycle_state: Option<LifecycleState>,
    #[serde(default)]
    pub is_initialized: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tool_count: u32,
    #[serde(default)]
    pub skill_count: u32,
    #[serde(default)]
    pub active_calls: u32,
    #[serde(default)]
    pub max_concurrent: u32,
}
