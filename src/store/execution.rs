//! Execution Store - step-by-step plan execution state
//!
//! Tracks the active work plan, one [`ExecutionTimelineStep`] per plan step,
//! the thought log and the tool-call lifecycle. Every tool execution exists
//! twice (in `tool_execution_history` and, when it belongs to a step, in that
//! step's `tool_executions`); every mutation updates both copies by id.
//!
//! Step status only moves forward: pending -> running -> completed | failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Store;
use crate::core::types::{
    ExecutionTimelineStep, StepStatus, ToolExecution, ToolStatus, WorkPlan, WorkPlanStatus,
};

/// Substrings treated as failure when a producer omits `is_error`
const LEGACY_ERROR_MARKERS: [&str; 2] = ["execution failed", "tool failed"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub current_work_plan: Option<WorkPlan>,
    pub current_step_number: Option<u32>,
    pub current_step_status: Option<StepStatus>,
    pub execution_timeline: Vec<ExecutionTimelineStep>,
    pub current_tool_execution: Option<ToolExecution>,
    pub tool_execution_history: Vec<ToolExecution>,
}

impl ExecutionState {
    fn step_mut(&mut self, step_number: u32) -> Option<&mut ExecutionTimelineStep> {
        self.execution_timeline
            .iter_mut()
            .find(|s| s.step_number == step_number)
    }

    pub fn step(&self, step_number: u32) -> Option<&ExecutionTimelineStep> {
        self.execution_timeline
            .iter()
            .find(|s| s.step_number == step_number)
    }

    pub fn tool(&self, call_id: &str) -> Option<&ToolExecution> {
        self.tool_execution_history.iter().find(|t| t.id == call_id)
    }

    /// Tool executions still running
    pub fn running_tool_count(&self) -> usize {
        self.tool_execution_history
            .iter()
            .filter(|t| t.status == ToolStatus::Running)
            .count()
    }

    /// (completed steps, total steps)
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .execution_timeline
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (done, self.execution_timeline.len())
    }

    pub fn is_executing(&self) -> bool {
        self.current_step_status == Some(StepStatus::Running) || self.running_tool_count() > 0
    }

    /// Apply `f` to the history copy and the nested step copy of a tool execution
    fn update_tool(&mut self, call_id: &str, f: impl Fn(&mut ToolExecution)) -> bool {
        let mut found = false;
        let mut step_number = None;
        if let Some(tool) = self
            .tool_execution_history
            .iter_mut()
            .find(|t| t.id == call_id)
        {
            f(tool);
            step_number = tool.step_number;
            found = true;
        }
        let steps = self
            .execution_timeline
            .iter_mut()
            .filter(|s| step_number.map_or(true, |n| s.step_number == n));
        for step in steps {
            if let Some(tool) = step.tool_executions.iter_mut().find(|t| t.id == call_id) {
                f(tool);
                found = true;
            }
        }
        if let Some(current) = self.current_tool_execution.as_mut() {
            if current.id == call_id {
                f(current);
            }
        }
        found
    }
}

/// Observable execution state of the live conversation
#[derive(Debug, Clone)]
pub struct ExecutionStore {
    store: Store<ExecutionState>,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self {
            store: Store::new("execution", ExecutionState::default()),
        }
    }

    pub fn store(&self) -> &Store<ExecutionState> {
        &self.store
    }

    pub fn state(&self) -> ExecutionState {
        self.store.get_state()
    }

    /// Replace the plan and start a fresh execution record
    pub fn set_work_plan(&self, plan: WorkPlan) {
        tracing::debug!("Work plan {} with {} steps", plan.id, plan.steps.len());
        self.store.set_state(|s| {
            s.execution_timeline = plan
                .steps
                .iter()
                .map(ExecutionTimelineStep::from_plan_step)
                .collect();
            s.tool_execution_history.clear();
            s.current_tool_execution = None;
            s.current_step_number = None;
            s.current_step_status = None;
            s.current_work_plan = Some(plan);
        });
    }

    /// Mark step `step_number` running
    ///
    /// The current-step pointer moves even when no timeline entry exists yet,
    /// since steps can be announced before their skeleton arrives. A terminal
    /// step keeps its status.
    pub fn start_step(&self, step_number: u32, description: &str) {
        self.store.set_state(|s| {
            let status = s
                .step(step_number)
                .map(|step| step.status)
                .filter(|status| status.is_terminal())
                .unwrap_or(StepStatus::Running);
            s.current_step_number = Some(step_number);
            s.current_step_status = Some(status);
            if let Some(plan) = s.current_work_plan.as_mut() {
                if plan.status == WorkPlanStatus::Planning {
                    plan.status = WorkPlanStatus::InProgress;
                }
            }
            match s.step_mut(step_number) {
                Some(step) if step.status == StepStatus::Pending => {
                    step.status = StepStatus::Running;
                    step.start_time = Some(Utc::now());
                    if step.description.is_empty() {
                        step.description = description.to_string();
                    }
                }
                Some(step) => {
                    tracing::debug!(
                        "start_step({}) ignored for step in {:?} state",
                        step_number,
                        step.status
                    );
                }
                None => {
                    tracing::debug!("start_step({}) has no timeline entry yet", step_number);
                }
            }
        });
    }

    /// Finish a step, settle its running tools and advance the plan pointer
    pub fn complete_step(&self, step_number: u32, success: bool, next_step_index: usize) {
        let now = Utc::now();
        let (step_status, tool_status) = if success {
            (StepStatus::Completed, ToolStatus::Success)
        } else {
            (StepStatus::Failed, ToolStatus::Failed)
        };

        self.store.set_state(|s| {
            let mut orphaned = Vec::new();
            match s.step_mut(step_number) {
                Some(step) if !step.status.is_terminal() => {
                    step.status = step_status;
                    step.end_time = Some(now);
                    step.duration_ms = step.start_time.map(|start| elapsed_ms(start, now));
                    orphaned.extend(
                        step.tool_executions
                            .iter()
                            .filter(|t| t.status == ToolStatus::Running)
                            .map(|t| t.id.clone()),
                    );
                }
                Some(_) => {
                    tracing::debug!("complete_step({}) ignored: already terminal", step_number);
                }
                None => {
                    tracing::debug!("complete_step({}) has no timeline entry", step_number);
                }
            }
            orphaned.extend(
                s.tool_execution_history
                    .iter()
                    .filter(|t| t.step_number == Some(step_number))
                    .filter(|t| t.status == ToolStatus::Running)
                    .map(|t| t.id.clone()),
            );
            orphaned.sort();
            orphaned.dedup();
            for call_id in &orphaned {
                s.update_tool(call_id, |t| finish_tool(t, tool_status, None, now));
            }

            if s.current_step_number == Some(step_number) {
                s.current_step_status = Some(step_status);
            }
            if let Some(plan) = s.current_work_plan.as_mut() {
                plan.current_step_index = next_step_index;
                if !success {
                    plan.status = WorkPlanStatus::Failed;
                } else if next_step_index >= plan.steps.len() {
                    plan.status = WorkPlanStatus::Completed;
                }
            }
        });
    }

    /// Append a thought to `step_number`, or to the current step
    pub fn add_thought(&self, thought: &str, step_number: Option<u32>) -> bool {
        self.store.set_state(|s| {
            let Some(target) = step_number.or(s.current_step_number) else {
                return false;
            };
            match s.step_mut(target) {
                Some(step) => {
                    step.thoughts.push(thought.to_string());
                    true
                }
                None => false,
            }
        })
    }

    /// Record a tool call; repeated calls with the same id update it in place
    ///
    /// Returns the call id, generated when the caller has none.
    pub fn start_tool(
        &self,
        tool_name: &str,
        input: Value,
        step_number: Option<u32>,
        call_id: Option<String>,
        start_time: Option<DateTime<Utc>>,
    ) -> String {
        let call_id = call_id.unwrap_or_else(|| format!("tool-{}", uuid::Uuid::new_v4()));
        let start_time = start_time.unwrap_or_else(Utc::now);

        self.store.set_state(|s| {
            let step_number = step_number.or(s.current_step_number);
            let existing = s.tool(&call_id).map(|t| t.status);
            if let Some(status) = existing {
                if status != ToolStatus::Running {
                    tracing::debug!(
                        "start_tool ignored for settled call {} ({:?})",
                        call_id,
                        status
                    );
                    return;
                }
                s.update_tool(&call_id, |t| t.input = input.clone());
                tracing::debug!("start_tool upserted existing call {}", call_id);
                s.current_tool_execution = s.tool(&call_id).cloned();
                return;
            }

            let resolved_step = step_number.filter(|n| s.step(*n).is_some());
            let execution = ToolExecution {
                id: call_id.clone(),
                tool_name: tool_name.to_string(),
                input,
                status: ToolStatus::Running,
                result: None,
                error: None,
                start_time,
                end_time: None,
                duration_ms: None,
                step_number: resolved_step,
            };
            if let Some(step) = resolved_step.and_then(|n| s.step_mut(n)) {
                step.tool_executions.push(execution.clone());
            }
            s.tool_execution_history.push(execution.clone());
            s.current_tool_execution = Some(execution);
        });
        call_id
    }

    /// Settle a tool call with its observation
    ///
    /// Without `call_id` the currently tracked tool is completed and stays
    /// current so its observation remains visible; with an explicit id the
    /// current-tool pointer is cleared. Returns `false` if no tool matched.
    pub fn complete_tool(
        &self,
        call_id: Option<&str>,
        observation: &str,
        is_error: Option<bool>,
    ) -> bool {
        let now = Utc::now();
        let failed = classify_error(observation, is_error);
        let status = if failed {
            ToolStatus::Failed
        } else {
            ToolStatus::Success
        };

        self.store.set_state(|s| {
            let target = match call_id {
                Some(id) => Some(id.to_string()),
                None => s.current_tool_execution.as_ref().map(|t| t.id.clone()),
            };
            let Some(target) = target else {
                tracing::debug!("complete_tool without a tracked tool");
                return false;
            };

            let found = s.update_tool(&target, |t| {
                finish_tool(t, status, Some(observation), now);
            });
            if !found {
                tracing::warn!("complete_tool for unknown call {}", target);
            }
            if call_id.is_some() {
                s.current_tool_execution = None;
            }
            found
        })
    }

    pub fn reset(&self) {
        self.store.replace(ExecutionState::default());
    }

    pub fn snapshot(&self) -> ExecutionState {
        self.store.get_state()
    }

    pub fn restore(&self, state: ExecutionState) {
        self.store.replace(state);
    }

    pub(crate) fn restore_quiet(&self, state: ExecutionState) {
        self.store.set_state_quiet(|s| *s = state);
    }
}

/// Explicit flag first; substring scan only for producers that omit it
fn classify_error(observation: &str, is_error: Option<bool>) -> bool {
    match is_error {
        Some(flag) => flag,
        None => {
            let lower = observation.to_lowercase();
            LEGACY_ERROR_MARKERS.iter().any(|m| lower.contains(m))
        }
    }
}

fn finish_tool(
    tool: &mut ToolExecution,
    status: ToolStatus,
    observation: Option<&str>,
    now: DateTime<Utc>,
) {
    if tool.status != ToolStatus::Running {
        return;
    }
    tool.status = status;
    tool.end_time = Some(now);
    tool.duration_ms = Some(elapsed_ms(tool.start_time, now));
    if let Some(observation) = observation {
        match status {
            ToolStatus::Failed => tool.error = Some(observation.to_string()),
            _ => tool.result = Some(observation.to_string()),
        }
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PlanStep;
    use serde_json::json;

    fn two_step_plan() -> WorkPlan {
        WorkPlan::new(
            "plan-1",
            vec![PlanStep::new(1, "search"), PlanStep::new(2, "summarize")],
        )
    }

    #[test]
    fn test_set_work_plan_builds_pending_skeleton() {
        let store = ExecutionStore::new();
        store.start_tool("stale", json!({}), None, Some("old".to_string()), None);
        store.set_work_plan(two_step_plan());

        let state = store.state();
        assert_eq!(state.execution_timeline.len(), 2);
        assert!(state
            .execution_timeline
            .iter()
            .all(|s| s.status == StepStatus::Pending && s.thoughts.is_empty()));
        assert!(state.tool_execution_history.is_empty());
        assert!(state.current_tool_execution.is_none());
    }

    #[test]
    fn test_start_step_unknown_still_moves_pointer() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        store.start_step(9, "surprise");

        let state = store.state();
        assert_eq!(state.current_step_number, Some(9));
        assert_eq!(state.current_step_status, Some(StepStatus::Running));
        assert!(state.execution_timeline.iter().all(|s| s.start_time.is_none()));
    }

    #[test]
    fn test_completed_step_is_not_reopened() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        store.start_step(1, "search");
        store.complete_step(1, true, 1);
        store.start_step(1, "search again");

        let state = store.state();
        assert_eq!(state.step(1).unwrap().status, StepStatus::Completed);
        assert_eq!(state.current_step_status, Some(StepStatus::Completed));
        assert!(!state.is_executing());
    }

    #[test]
    fn test_duplicate_start_does_not_reopen_settled_tool() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        store.start_step(1, "search");
        store.start_tool("search", json!({"q": "x"}), Some(1), Some("t1".to_string()), None);
        store.complete_tool(Some("t1"), "found", Some(false));

        store.start_tool("search", json!({"q": "x"}), Some(1), Some("t1".to_string()), None);

        let state = store.state();
        let tool = state.tool("t1").unwrap();
        assert_eq!(tool.status, ToolStatus::Success);
        assert_eq!(tool.result.as_deref(), Some("found"));
        assert_eq!(state.step(1).unwrap().tool_executions[0].status, ToolStatus::Success);
        assert_eq!(state.running_tool_count(), 0);
        assert!(state.current_tool_execution.is_none());
    }

    #[test]
    fn test_complete_step_failure_cascades_to_running_tools() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        store.start_step(1, "search");
        store.start_tool("search", json!({"q": "x"}), Some(1), Some("t1".to_string()), None);
        store.start_tool("fetch", json!({}), Some(1), Some("t2".to_string()), None);
        store.complete_tool(Some("t2"), "ok", Some(false));

        store.complete_step(1, false, 1);

        let state = store.state();
        let step = state.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.end_time.is_some());
        let t1 = step.tool_executions.iter().find(|t| t.id == "t1").unwrap();
        assert_eq!(t1.status, ToolStatus::Failed);
        assert!(t1.end_time.is_some());
        let t2 = step.tool_executions.iter().find(|t| t.id == "t2").unwrap();
        assert_eq!(t2.status, ToolStatus::Success);
        assert_eq!(state.tool("t1").unwrap().status, ToolStatus::Failed);
        assert_eq!(state.current_work_plan.unwrap().current_step_index, 1);
    }

    #[test]
    fn test_add_thought_falls_back_to_current_step() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        assert!(!store.add_thought("nowhere", None));

        store.start_step(2, "summarize");
        assert!(store.add_thought("thinking", None));
        assert!(store.add_thought("explicit", Some(1)));
        assert!(!store.add_thought("missing", Some(7)));

        let state = store.state();
        assert_eq!(state.step(2).unwrap().thoughts, vec!["thinking"]);
        assert_eq!(state.step(1).unwrap().thoughts, vec!["explicit"]);
    }

    #[test]
    fn test_start_tool_twice_upserts() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        store.start_tool("search", json!({"q": "a"}), Some(1), Some("t1".to_string()), None);
        store.start_tool("search", json!({"q": "b"}), Some(1), Some("t1".to_string()), None);

        let state = store.state();
        assert_eq!(state.tool_execution_history.len(), 1);
        assert_eq!(state.step(1).unwrap().tool_executions.len(), 1);
        assert_eq!(state.tool("t1").unwrap().input, json!({"q": "b"}));
        assert_eq!(state.step(1).unwrap().tool_executions[0].input, json!({"q": "b"}));
    }

    #[test]
    fn test_start_tool_generates_call_id() {
        let store = ExecutionStore::new();
        let id = store.start_tool("search", json!({}), None, None, None);
        assert!(id.starts_with("tool-"));
        assert!(store.state().tool(&id).is_some());
        assert_eq!(store.state().tool(&id).unwrap().step_number, None);
    }

    #[test]
    fn test_complete_tool_without_id_keeps_current() {
        let store = ExecutionStore::new();
        store.start_tool("search", json!({}), None, Some("t1".to_string()), None);

        assert!(store.complete_tool(None, "ok", None));

        let state = store.state();
        let current = state.current_tool_execution.expect("current tool kept");
        assert_eq!(current.id, "t1");
        assert_eq!(current.status, ToolStatus::Success);
        assert_eq!(current.result.as_deref(), Some("ok"));
    }

    #[test]
    fn test_complete_tool_with_id_clears_current() {
        let store = ExecutionStore::new();
        store.start_tool("search", json!({}), None, Some("t1".to_string()), None);

        assert!(store.complete_tool(Some("t1"), "ok", None));

        let state = store.state();
        assert!(state.current_tool_execution.is_none());
        assert_eq!(state.tool("t1").unwrap().status, ToolStatus::Success);
        assert!(state.tool("t1").unwrap().duration_ms.is_some());
    }

    #[test]
    fn test_explicit_flag_beats_heuristic() {
        let store = ExecutionStore::new();
        store.start_tool("shell", json!({}), None, Some("a".to_string()), None);
        store.start_tool("shell", json!({}), None, Some("b".to_string()), None);
        store.start_tool("shell", json!({}), None, Some("c".to_string()), None);

        store.complete_tool(Some("a"), "Tool failed: but flag says fine", Some(false));
        store.complete_tool(Some("b"), "Execution failed: boom", None);
        store.complete_tool(Some("c"), "all good", Some(true));

        let state = store.state();
        assert_eq!(state.tool("a").unwrap().status, ToolStatus::Success);
        assert_eq!(state.tool("b").unwrap().status, ToolStatus::Failed);
        assert_eq!(
            state.tool("b").unwrap().error.as_deref(),
            Some("Execution failed: boom")
        );
        assert_eq!(state.tool("c").unwrap().status, ToolStatus::Failed);
    }

    #[test]
    fn test_duplicate_completion_does_not_restamp() {
        let store = ExecutionStore::new();
        store.start_tool("search", json!({}), None, Some("t1".to_string()), None);
        store.complete_tool(Some("t1"), "first", Some(false));
        let first_end = store.state().tool("t1").unwrap().end_time;

        store.complete_tool(Some("t1"), "second", Some(true));
        let tool = store.state().tool("t1").cloned().unwrap();
        assert_eq!(tool.end_time, first_end);
        assert_eq!(tool.status, ToolStatus::Success);
        assert_eq!(tool.result.as_deref(), Some("first"));
    }

    #[test]
    fn test_end_to_end_two_step_scenario() {
        let store = ExecutionStore::new();
        store.set_work_plan(two_step_plan());
        store.start_step(1, "search");
        store.add_thought("t1", Some(1));
        store.start_tool("search", json!({"q": "x"}), Some(1), Some("tool-1".to_string()), None);
        store.complete_tool(Some("tool-1"), "found it", Some(false));
        store.complete_step(1, true, 1);

        let state = store.state();
        let step = state.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.thoughts, vec!["t1"]);
        assert_eq!(step.tool_executions.len(), 1);
        assert_eq!(step.tool_executions[0].status, ToolStatus::Success);
        assert_eq!(
            state.current_work_plan.as_ref().unwrap().current_step_index,
            1
        );
        assert_eq!(state.progress(), (1, 2));
    }
}
