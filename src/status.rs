//! Unified agent status
//!
//! One read-only view combining lifecycle data from the push subscription,
//! execution progress, plan mode, streaming and the sandbox connection.
//! [`derive_unified_status`] is pure; [`StatusDeriver`] memoizes it for
//! callers that re-render on every store notification.

use serde::{Deserialize, Serialize};

use crate::core::types::{
    AgentMode, LifecycleData, LifecycleState, PlanDocumentStatus, StepStatus,
};
use crate::store::{ExecutionState, PlanModeState, StreamingPhase, StreamingState};

/// What the agent is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    #[default]
    Idle,
    Thinking,
    Acting,
    Streaming,
    AwaitingInput,
    Error,
}

impl AgentActivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Acting => "acting",
            Self::Streaming => "streaming",
            Self::AwaitingInput => "awaiting_input",
            Self::Error => "error",
        }
    }
}

/// Everything the unified status depends on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusInputs {
    pub lifecycle: Option<LifecycleData>,
    pub step_status: Option<StepStatus>,
    pub current_step: Option<u32>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub active_tool_calls: usize,
    pub mode: AgentMode,
    pub is_plan_mode: bool,
    pub plan_status: Option<PlanDocumentStatus>,
    pub streaming_phase: StreamingPhase,
    pub pending_hitl: usize,
    pub sandbox_id: Option<String>,
}

impl StatusInputs {
    /// Collect inputs from live store states
    pub fn collect(
        lifecycle: Option<&LifecycleData>,
        execution: &ExecutionState,
        plan_mode: &PlanModeState,
        streaming: &StreamingState,
        pending_hitl: usize,
        sandbox_id: Option<&str>,
    ) -> Self {
        let (completed_steps, total_steps) = execution.progress();
        Self {
            lifecycle: lifecycle.cloned(),
            step_status: execution.current_step_status,
            current_step: execution.current_step_number,
            completed_steps,
            total_steps,
            active_tool_calls: execution.running_tool_count(),
            mode: plan_mode.current_mode(),
            is_plan_mode: plan_mode.is_in_plan_mode(),
            plan_status: plan_mode.current_plan.as_ref().map(|p| p.status),
            streaming_phase: streaming.phase,
            pending_hitl,
            sandbox_id: sandbox_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedAgentStatus {
    pub lifecycle: LifecycleState,
    pub is_initialized: bool,
    pub is_active: bool,
    pub error_message: Option<String>,
    pub activity: AgentActivity,
    pub mode: AgentMode,
    pub is_plan_mode: bool,
    pub plan_status: Option<PlanDocumentStatus>,
    pub current_step: Option<u32>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub active_tool_calls: usize,
    pub is_streaming: bool,
    pub pending_hitl: usize,
    pub tool_count: u32,
    pub skill_count: u32,
    pub active_calls: u32,
    pub max_concurrent: u32,
    pub sandbox_connected: bool,
    pub sandbox_id: Option<String>,
}

/// Lifecycle label: the explicit server state wins, otherwise it is inferred
/// from the flags with error > ready > initializing > paused > uninitialized
pub fn derive_lifecycle(lifecycle: Option<&LifecycleData>) -> LifecycleState {
    let Some(data) = lifecycle else {
        return LifecycleState::Uninitialized;
    };
    if let Some(state) = data.lifecycle_state {
        return state;
    }
    let has_error = data
        .error_message
        .as_deref()
        .is_some_and(|m| !m.trim().is_empty());

    match (has_error, data.is_initialized, data.is_active) {
        (true, _, _) => LifecycleState::Error,
        (false, true, true) => LifecycleState::Ready,
        (false, false, true) => LifecycleState::Initializing,
        (false, true, false) => LifecycleState::Paused,
        (false, false, false) => LifecycleState::Uninitialized,
    }
}

fn derive_activity(inputs: &StatusInputs, lifecycle: LifecycleState) -> AgentActivity {
    if lifecycle == LifecycleState::Error {
        return AgentActivity::Error;
    }
    if inputs.pending_hitl > 0 {
        return AgentActivity::AwaitingInput;
    }
    if inputs.active_tool_calls > 0 {
        return AgentActivity::Acting;
    }
    match inputs.streaming_phase {
        StreamingPhase::Streaming => AgentActivity::Streaming,
        StreamingPhase::Connecting => AgentActivity::Thinking,
        StreamingPhase::Error => AgentActivity::Error,
        StreamingPhase::Idle | StreamingPhase::Completed => {
            if inputs.step_status == Some(StepStatus::Running) {
                AgentActivity::Thinking
            } else {
                AgentActivity::Idle
            }
        }
    }
}

pub fn derive_unified_status(inputs: &StatusInputs) -> UnifiedAgentStatus {
    let lifecycle = derive_lifecycle(inputs.lifecycle.as_ref());
    let data = inputs.lifecycle.clone().unwrap_or_default();

    UnifiedAgentStatus {
        lifecycle,
        is_initialized: data.is_initialized,
        is_active: data.is_active,
        error_message: data.error_message,
        activity: derive_activity(inputs, lifecycle),
        mode: inputs.mode,
        is_plan_mode: inputs.is_plan_mode,
        plan_status: inputs.plan_status,
        current_step: inputs.current_step,
        completed_steps: inputs.completed_steps,
        total_steps: inputs.total_steps,
        active_tool_calls: inputs.active_tool_calls,
        is_streaming: inputs.streaming_phase.is_active(),
        pending_hitl: inputs.pending_hitl,
        tool_count: data.tool_count,
        skill_count: data.skill_count,
        active_calls: data.active_calls,
        max_concurrent: data.max_concurrent,
        sandbox_connected: inputs.sandbox_id.is_some(),
        sandbox_id: inputs.sandbox_id.clone(),
    }
}

/// Memoized [`derive_unified_status`]
#[derive(Debug, Default)]
pub struct StatusDeriver {
    cached: Option<(StatusInputs, UnifiedAgentStatus)>,
    computations: usize,
}

impl StatusDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes only when `inputs` differ from the previous call
    pub fn derive(&mut self, inputs: StatusInputs) -> UnifiedAgentStatus {
        if let Some((previous, status)) = &self.cached {
            if *previous == inputs {
                return status.clone();
            }
        }
        let status = derive_unified_status(&inputs);
        self.computations += 1;
        self.cached = Some((inputs, status.clone()));
        status
    }

    pub fn computations(&self) -> usize {
        self.computations
    }
}
