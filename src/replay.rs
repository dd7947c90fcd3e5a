//! Offline replay of recorded push events
//!
//! Feeds a JSON-lines capture of [`AgentEvent`] frames through an
//! [`EventRouter`] with no network behind the stores, then summarizes the
//! resulting state. Used by `agent-sync replay` and handy for reproducing
//! bug reports.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::core::errors::ServiceError;
use crate::core::traits::{
    ConversationService, HitlService, PlanService, ServiceResult, TimelineService,
};
use crate::core::types::{
    Conversation, PlanDocument, PlanModeStatus, PlanUpdate, StepStatus, TimelinePage, ToolStatus,
};
use crate::events::{AgentEvent, EventRouter, Routed};
use crate::status::UnifiedAgentStatus;
use crate::store::{ExecutionState, StreamingPhase};
use crate::workspace::{Services, Workspace};

const OFFLINE: &str = "offline replay: no service connected";

/// Service stand-in for replays; every request fails
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineServices;

impl OfflineServices {
    pub fn services() -> Services {
        let offline = Arc::new(OfflineServices);
        Services {
            timeline: offline.clone(),
            conversations: offline.clone(),
            plans: offline.clone(),
            hitl: offline,
        }
    }

    fn fail<T>() -> ServiceResult<T> {
        Err(ServiceError::new(OFFLINE))
    }
}

#[async_trait]
impl TimelineService for OfflineServices {
    async fn fetch_timeline(
        &self,
        _conversation_id: &str,
        _project_id: &str,
        _limit: usize,
        _before_sequence: Option<i64>,
    ) -> ServiceResult<TimelinePage> {
        Self::fail()
    }
}

#[async_trait]
impl ConversationService for OfflineServices {
    async fn list_conversations(
        &self,
        _project_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> ServiceResult<Vec<Conversation>> {
        Self::fail()
    }

    async fn create_conversation(
        &self,
        _project_id: &str,
        _title: Option<&str>,
    ) -> ServiceResult<Conversation> {
        Self::fail()
    }

    async fn get_conversation(
        &self,
        _conversation_id: &str,
        _project_id: &str,
    ) -> ServiceResult<Conversation> {
        Self::fail()
    }

    async fn delete_conversation(
        &self,
        _conversation_id: &str,
        _project_id: &str,
    ) -> ServiceResult<()> {
        Self::fail()
    }

    async fn update_title(
        &self,
        _conversation_id: &str,
        _project_id: &str,
        _title: &str,
    ) -> ServiceResult<Conversation> {
        Self::fail()
    }

    async fn generate_title(
        &self,
        _conversation_id: &str,
        _project_id: &str,
    ) -> ServiceResult<Conversation> {
        Self::fail()
    }
}

#[async_trait]
impl PlanService for OfflineServices {
    async fn enter_plan_mode(
        &self,
        _conversation_id: &str,
        _title: &str,
        _description: Option<&str>,
    ) -> ServiceResult<PlanDocument> {
        Self::fail()
    }

    async fn exit_plan_mode(&self, _conversation_id: &str, _plan_id: &str) -> ServiceResult<()> {
        Self::fail()
    }

    async fn get_plan(&self, _plan_id: &str) -> ServiceResult<PlanDocument> {
        Self::fail()
    }

    async fn update_plan(
        &self,
        _plan_id: &str,
        _update: &PlanUpdate,
    ) -> ServiceResult<PlanDocument> {
        Self::fail()
    }

    async fn get_plan_mode_status(&self, _conversation_id: &str) -> ServiceResult<PlanModeStatus> {
        Self::fail()
    }

    async fn submit_plan_for_review(&self, _plan_id: &str) -> ServiceResult<PlanDocument> {
        Self::fail()
    }

    async fn approve_plan(&self, _plan_id: &str) -> ServiceResult<PlanDocument> {
        Self::fail()
    }

    async fn reject_plan(
        &self,
        _plan_id: &str,
        _reason: Option<&str>,
    ) -> ServiceResult<PlanDocument> {
        Self::fail()
    }
}

#[async_trait]
impl HitlService for OfflineServices {
    async fn respond(
        &self,
        _request_id: &str,
        _request_kind: &str,
        _response: &Value,
    ) -> ServiceResult<()> {
        Self::fail()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step_number: u32,
    pub description: String,
    pub status: StepStatus,
    pub thoughts: usize,
    pub tools: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub plan_id: Option<String>,
    pub steps: Vec<StepSummary>,
    pub tools_succeeded: usize,
    pub tools_failed: usize,
    pub tools_running: usize,
}

impl ExecutionSummary {
    pub fn from_state(state: &ExecutionState) -> Self {
        let count = |status: ToolStatus| {
            state
                .tool_execution_history
                .iter()
                .filter(|t| t.status == status)
                .count()
        };
        Self {
            plan_id: state.current_work_plan.as_ref().map(|p| p.id.clone()),
            steps: state
                .execution_timeline
                .iter()
                .map(|s| StepSummary {
                    step_number: s.step_number,
                    description: s.description.clone(),
                    status: s.status,
                    thoughts: s.thoughts.len(),
                    tools: s.tool_executions.len(),
                })
                .collect(),
            tools_succeeded: count(ToolStatus::Success),
            tools_failed: count(ToolStatus::Failed),
            tools_running: count(ToolStatus::Running),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub conversation_id: Option<String>,
    pub events_total: usize,
    pub applied: usize,
    pub ignored: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub status: UnifiedAgentStatus,
    pub streaming_phase: StreamingPhase,
    pub response: String,
    pub timeline_events: usize,
    pub pending_hitl: Vec<String>,
    pub execution: ExecutionSummary,
}

/// Replay every frame of `reader` into a fresh workspace
///
/// `conversation` selects the live conversation; without it the first
/// conversation named in the capture is used. Malformed lines are counted and
/// reported, never fatal.
pub fn replay(
    reader: impl BufRead,
    conversation: Option<&str>,
    config: &Config,
) -> Result<ReplayReport> {
    let mut events = Vec::new();
    let mut errors = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<AgentEvent>(line) {
            Ok(event) => events.push((index + 1, event)),
            Err(e) => errors.push(format!("line {}: {}", index + 1, e)),
        }
    }
    let events_total = events.len() + errors.len();
    let mut failed = errors.len();

    let conversation_id = conversation.map(str::to_string).or_else(|| {
        events
            .iter()
            .find_map(|(_, e)| e.target_conversation().map(str::to_string))
    });

    let workspace = Workspace::new(OfflineServices::services(), config);
    if let Some(id) = conversation_id.as_deref() {
        workspace
            .switch_conversation(id)
            .with_context(|| format!("Failed to open conversation {}", id))?;
    }
    let router = EventRouter::new(workspace.clone());

    let (mut applied, mut ignored) = (0, 0);
    for (line, event) in &events {
        match router.route(event) {
            Ok(Routed::Applied) => applied += 1,
            Ok(Routed::Ignored) => ignored += 1,
            Err(e) => {
                tracing::warn!("line {}: {}", line, e);
                errors.push(format!("line {}: {}", line, e));
                failed += 1;
            }
        }
    }

    let streaming = workspace.streaming.state();
    let pending_hitl = conversation_id
        .as_deref()
        .map(|id| {
            workspace
                .hitl
                .get_pending_for_conversation(id)
                .into_iter()
                .map(|r| format!("{} ({})", r.request_id, r.kind.name()))
                .collect()
        })
        .unwrap_or_default();

    Ok(ReplayReport {
        conversation_id,
        events_total,
        applied,
        ignored,
        failed,
        errors,
        status: workspace.unified_status(),
        streaming_phase: streaming.phase,
        response: streaming.draft,
        timeline_events: workspace.timeline.len(),
        pending_hitl,
        execution: ExecutionSummary::from_state(&workspace.execution.state()),
    })
}

/// Human-readable rendering of a report
pub fn render_text(report: &ReplayReport) -> String {
    let mut out = String::new();
    let status = &report.status;
    out.push_str(&format!(
        "Conversation: {}\n",
        report.conversation_id.as_deref().unwrap_or("(none)")
    ));
    out.push_str(&format!(
        "Events: {} total, {} applied, {} ignored, {} failed\n",
        report.events_total, report.applied, report.ignored, report.failed
    ));
    out.push_str(&format!(
        "Lifecycle: {}  Activity: {}  Mode: {}\n",
        status.lifecycle.as_str(),
        status.activity.as_str(),
        status.mode
    ));
    out.push_str(&format!(
        "Streaming: {}  Timeline events: {}\n",
        report.streaming_phase.as_str(),
        report.timeline_events
    ));

    let exec = &report.execution;
    if let Some(plan_id) = &exec.plan_id {
        out.push_str(&format!(
            "Plan {}: {}/{} steps completed\n",
            plan_id, status.completed_steps, status.total_steps
        ));
        for step in &exec.steps {
            out.push_str(&format!(
                "  [{}] {}. {} ({} thoughts, {} tools)\n",
                step_label(step.status),
                step.step_number,
                step.description,
                step.thoughts,
                step.tools
            ));
        }
    }
    out.push_str(&format!(
        "Tools: {} succeeded, {} failed, {} running\n",
        exec.tools_succeeded, exec.tools_failed, exec.tools_running
    ));
    if !report.pending_hitl.is_empty() {
        out.push_str(&format!("Pending HITL: {}\n", report.pending_hitl.join(", ")));
    }
    if !report.response.is_empty() {
        out.push_str(&format!("Response: {}\n", report.response));
    }
    for error in &report.errors {
        out.push_str(&format!("error: {}\n", error));
    }
    out
}

fn step_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => " ",
        StepStatus::Running => ">",
        StepStatus::Completed => "x",
        StepStatus::Failed => "!",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = r#"
{"type": "lifecycle_state_changed", "data": {"is_initialized": true, "is_active": true, "tool_count": 4}}
{"type": "message_start", "conversation_id": "c1", "data": {"message_id": "m1"}}
{"type": "work_plan", "conversation_id": "c1", "data": {"plan": {"id": "plan-1", "steps": [{"step_number": 1, "description": "search"}, {"step_number": 2, "description": "answer"}]}}}
{"type": "step_start", "conversation_id": "c1", "data": {"step_number": 1, "description": "search"}}
{"type": "act", "conversation_id": "c1", "data": {"tool_name": "search", "tool_input": {"q": "x"}, "call_id": "tool-1", "step_number": 1}}
{"type": "observe", "conversation_id": "c1", "data": {"tool_name": "search", "observation": "found it", "call_id": "tool-1", "is_error": false}}
{"type": "step_end", "conversation_id": "c1", "data": {"step_number": 1, "success": true, "next_step_index": 1}}
{"type": "text_delta", "conversation_id": "c1", "data": {"delta": "Done"}}
{"type": "text_delta", "conversation_id": "c2", "data": {"delta": "other conversation"}}
{"type": "decision_asked", "conversation_id": "c1", "data": {"request_id": "r1", "question": "Continue?"}}
not json
"#;

    #[test]
    fn test_replay_summarizes_capture() {
        let report = replay(CAPTURE.as_bytes(), None, &Config::default()).unwrap();

        assert_eq!(report.conversation_id.as_deref(), Some("c1"));
        assert_eq!(report.failed, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.applied, 9);
        assert_eq!(report.response, "Done");
        assert_eq!(report.execution.plan_id.as_deref(), Some("plan-1"));
        assert_eq!(report.execution.steps[0].status, StepStatus::Completed);
        assert_eq!(report.execution.tools_succeeded, 1);
        assert_eq!(report.pending_hitl, vec!["r1 (decision)".to_string()]);
        assert_eq!(report.status.pending_hitl, 1);
        assert_eq!(report.status.tool_count, 4);
    }

    #[test]
    fn test_render_text_mentions_plan_and_errors() {
        let report = replay(CAPTURE.as_bytes(), Some("c1"), &Config::default()).unwrap();
        let text = render_text(&report);
        assert!(text.contains("Conversation: c1"));
        assert!(text.contains("Plan plan-1: 1/2 steps completed"));
        assert!(text.contains("[x] 1. search"));
        assert!(text.contains("error: line"));
    }
}
