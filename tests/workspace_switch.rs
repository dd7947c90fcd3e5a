//! Conversation switching, snapshots, send locks and status watches

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_sync::config::Config;
use agent_sync::core::{PlanStep, SwitchError, WorkPlan};
use agent_sync::replay::OfflineServices;
use agent_sync::status::AgentActivity;
use agent_sync::store::{StreamingPhase, TimelineState};
use agent_sync::Workspace;
use serde_json::json;

fn workspace() -> Workspace {
    Workspace::new(OfflineServices::services(), &Config::default())
}

fn workspace_with_cache(capacity: usize) -> Workspace {
    let mut config = Config::default();
    config.workspace.max_cached_conversations = capacity;
    Workspace::new(OfflineServices::services(), &config)
}

fn plan(id: &str) -> WorkPlan {
    WorkPlan::new(
        id,
        vec![PlanStep::new(1, "search"), PlanStep::new(2, "answer")],
    )
}

#[test]
fn test_first_switch_starts_from_defaults() {
    let ws = workspace();
    assert!(ws.live_conversation_id().is_none());

    ws.switch_conversation("c1").unwrap();

    assert!(ws.is_live("c1"));
    assert_eq!(ws.timeline.state().conversation_id.as_deref(), Some("c1"));
    assert_eq!(ws.streaming.phase(), StreamingPhase::Idle);
    assert!(ws.execution.state().current_work_plan.is_none());
    assert_eq!(ws.cached_conversations(), 0);
}

#[test]
fn test_switching_to_live_conversation_is_rejected() {
    let ws = workspace();
    ws.switch_conversation("c1").unwrap();

    let err = ws.switch_conversation("c1").unwrap_err();
    assert_eq!(err, SwitchError::AlreadyLive("c1".to_string()));
}

#[test]
fn test_switch_back_restores_saved_state() {
    let ws = workspace();
    ws.switch_conversation("c1").unwrap();
    ws.set_draft("half-typed question");
    ws.streaming.append_text("partial answer").unwrap();
    ws.execution.set_work_plan(plan("plan-c1"));
    ws.execution.start_step(1, "search");

    ws.switch_conversation("c2").unwrap();
    assert_eq!(ws.draft(), "");
    assert_eq!(ws.streaming.draft(), "");
    assert!(ws.execution.state().current_work_plan.is_none());
    assert_eq!(ws.cached_conversations(), 1);

    let saved = ws.conversation_state("c1").unwrap();
    assert_eq!(saved.draft, "half-typed question");
    assert_eq!(saved.streaming.draft, "partial answer");

    ws.switch_conversation("c1").unwrap();
    assert_eq!(ws.draft(), "half-typed question");
    assert_eq!(ws.streaming.draft(), "partial answer");
    assert_eq!(ws.streaming.phase(), StreamingPhase::Streaming);
    let execution = ws.execution.state();
    assert_eq!(
        execution.current_work_plan.as_ref().map(|p| p.id.as_str()),
        Some("plan-c1")
    );
    assert_eq!(execution.current_step_number, Some(1));
    // c1 left the cache when it became live again; c2 took its place
    assert!(ws.conversation_state("c2").is_some());
    assert_eq!(ws.cached_conversations(), 1);
}

#[test]
fn test_listeners_never_observe_mixed_state() {
    let ws = workspace();
    ws.switch_conversation("c1").unwrap();
    ws.streaming.append_text("from c1").unwrap();
    ws.execution.set_work_plan(plan("plan-c1"));
    ws.switch_conversation("c2").unwrap();

    // Every listener reads the other stores while it is being notified
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _timeline_sub = {
        let reader = ws.clone();
        let seen = Arc::clone(&seen);
        ws.timeline.store().subscribe(move |timeline: &TimelineState| {
            let plan = reader
                .execution
                .state()
                .current_work_plan
                .map(|p| p.id)
                .unwrap_or_default();
            seen.lock().unwrap().push((
                timeline.conversation_id.clone().unwrap_or_default(),
                plan,
                reader.streaming.draft(),
            ));
        })
    };

    ws.switch_conversation("c1").unwrap();
    ws.switch_conversation("c2").unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            ("c1".to_string(), "plan-c1".to_string(), "from c1".to_string()),
            ("c2".to_string(), String::new(), String::new()),
        ]
    );
}

#[test]
fn test_eviction_keeps_conversations_with_send_in_flight() {
    let ws = workspace_with_cache(2);
    ws.switch_conversation("c1").unwrap();
    ws.begin_send("c1").unwrap();

    for id in ["c2", "c3", "c4"] {
        ws.switch_conversation(id).unwrap();
    }

    // c1, c2 and c3 were saved; c2 was the oldest unlocked snapshot
    assert!(ws.conversation_state("c1").is_some());
    assert!(ws.conversation_state("c2").is_none());
    assert!(ws.conversation_state("c3").is_some());
    assert_eq!(ws.cached_conversations(), 2);
}

#[test]
fn test_evicted_conversation_starts_fresh() {
    let ws = workspace_with_cache(1);
    ws.switch_conversation("c1").unwrap();
    ws.set_draft("lost");
    ws.switch_conversation("c2").unwrap();
    ws.switch_conversation("c3").unwrap();

    ws.switch_conversation("c1").unwrap();
    assert_eq!(ws.draft(), "");
    assert_eq!(ws.timeline.state().conversation_id.as_deref(), Some("c1"));
}

#[test]
fn test_send_lock_is_exclusive_per_conversation() {
    let ws = workspace();
    ws.switch_conversation("c1").unwrap();

    ws.begin_send("c1").unwrap();
    assert_eq!(ws.streaming.phase(), StreamingPhase::Connecting);
    assert_eq!(
        ws.begin_send("c1").unwrap_err(),
        SwitchError::SendInFlight("c1".to_string())
    );

    // A background conversation can send at the same time
    ws.begin_send("c2").unwrap();
    assert_eq!(
        ws.locks().locked_conversations(),
        vec!["c1".to_string(), "c2".to_string()]
    );

    assert!(ws.end_send("c1"));
    assert!(!ws.end_send("c1"));
    assert!(ws.begin_send("c1").is_ok());
}

#[test]
fn test_unified_status_follows_live_conversation() {
    let ws = workspace();
    ws.switch_conversation("c1").unwrap();
    ws.execution.set_work_plan(plan("plan-c1"));
    ws.execution.start_step(1, "search");
    ws.execution
        .start_tool("search", json!({"q": "rust"}), None, Some("t1".to_string()), None);

    let status = ws.unified_status();
    assert_eq!(status.activity, AgentActivity::Acting);
    assert_eq!(status.total_steps, 2);
    assert_eq!(status.active_tool_calls, 1);

    ws.hitl
        .handle_hitl_event(
            "decision_asked",
            &json!({"request_id": "r1", "question": "Proceed?"}),
            "c1",
        )
        .unwrap();
    assert_eq!(ws.unified_status().activity, AgentActivity::AwaitingInput);

    // Requests of a background conversation do not block the live one
    ws.switch_conversation("c2").unwrap();
    let status = ws.unified_status();
    assert_eq!(status.pending_hitl, 0);
    assert_eq!(status.activity, AgentActivity::Idle);
    assert!(ws.conversation_state("c1").unwrap().has_pending_hitl);
}

#[test]
fn test_status_watch_is_shared_by_key() {
    let ws = workspace();
    ws.switch_conversation("c1").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let watch = |ws: &Workspace| {
        let calls = Arc::clone(&calls);
        ws.watch_status("status-bar", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert!(watch(&ws));
    assert!(!watch(&ws));

    ws.execution.set_work_plan(plan("plan-c1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Notifications that leave the status unchanged are not forwarded
    ws.execution.add_thought("thinking", None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(!ws.unwatch_status("status-bar"));
    ws.execution.start_step(1, "search");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(ws.unwatch_status("status-bar"));
    ws.execution.complete_step(1, true, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
