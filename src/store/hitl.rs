//! HITL Store - pending human-in-the-loop requests
//!
//! Requests are indexed twice: by request id in `pending_requests` and by
//! conversation in `requests_by_conversation`. Both indices change together and
//! a conversation entry is removed as soon as its set becomes empty. Answered
//! or expired requests move into a bounded history, newest first.
//!
//! Push events follow a naming convention: `*_asked` and `env_var_requested`
//! create a request, `*_answered`, `env_var_provided` and `permission_replied`
//! answer one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::Store;
use crate::config::HitlConfig;
use crate::core::errors::HitlError;
use crate::core::traits::HitlService;
use crate::core::types::{HitlRequest, HitlRequestKind, HitlStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HitlState {
    pub pending_requests: HashMap<String, HitlRequest>,
    pub requests_by_conversation: HashMap<String, HashSet<String>>,
    /// Terminal requests, newest first
    pub answered_history: VecDeque<HitlRequest>,
}

impl HitlState {
    pub fn pending_count(&self, conversation_id: &str) -> usize {
        self.requests_by_conversation
            .get(conversation_id)
            .map_or(0, HashSet::len)
    }

    pub fn total_pending(&self) -> usize {
        self.pending_requests.len()
    }

    fn insert_pending(&mut self, request: HitlRequest) {
        self.requests_by_conversation
            .entry(request.conversation_id.clone())
            .or_default()
            .insert(request.request_id.clone());
        self.pending_requests
            .insert(request.request_id.clone(), request);
    }

    /// Move a pending request into history with a terminal status
    fn settle(
        &mut self,
        request_id: &str,
        status: HitlStatus,
        response: Option<Value>,
        capacity: usize,
    ) -> Option<HitlRequest> {
        let mut request = self.pending_requests.remove(request_id)?;
        if let Some(ids) = self.requests_by_conversation.get_mut(&request.conversation_id) {
            ids.remove(request_id);
            if ids.is_empty() {
                self.requests_by_conversation.remove(&request.conversation_id);
            }
        }

        request.status = status;
        if status == HitlStatus::Answered {
            request.answered_at = Some(Utc::now());
            request.response = response;
        }
        self.answered_history.push_front(request.clone());
        self.answered_history.truncate(capacity);
        Some(request)
    }
}

/// Handle for the periodic timeout checker; stops the task on `cancel` or drop
#[must_use = "dropping the TimeoutChecker stops the timer"]
#[derive(Debug)]
pub struct TimeoutChecker {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl TimeoutChecker {
    pub fn cancel(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            self.running.store(false, Ordering::SeqCst);
            tracing::debug!("HITL timeout checker stopped");
        }
    }
}

impl Drop for TimeoutChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct HitlStore {
    store: Store<HitlState>,
    service: Arc<dyn HitlService>,
    default_timeout: TimeDelta,
    check_interval: Duration,
    history_capacity: usize,
    checker_running: Arc<AtomicBool>,
}

impl std::fmt::Debug for HitlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitlStore")
            .field("store", &self.store)
            .field("default_timeout", &self.default_timeout)
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}

impl HitlStore {
    pub fn new(service: Arc<dyn HitlService>, config: &HitlConfig) -> Self {
        let default_timeout = i64::try_from(config.default_timeout_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Self {
            store: Store::new("hitl", HitlState::default()),
            service,
            default_timeout,
            check_interval: Duration::from_millis(config.check_interval_ms.max(1)),
            history_capacity: config.history_capacity,
            checker_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Store<HitlState> {
        &self.store
    }

    pub fn state(&self) -> HitlState {
        self.store.get_state()
    }

    /// Interval configured for [`HitlStore::start_timeout_checker`]
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Apply a HITL push event
    ///
    /// Returns `Ok(true)` when the event created or answered a request, and
    /// `Ok(false)` for event types outside the HITL convention, duplicates and
    /// answers to unknown requests.
    pub fn handle_hitl_event(
        &self,
        event_type: &str,
        data: &Value,
        conversation_id: &str,
    ) -> Result<bool, HitlError> {
        if event_type == "env_var_requested" || event_type.ends_with("_asked") {
            return self.create_request(event_type, data, conversation_id);
        }
        if event_type == "env_var_provided"
            || event_type == "permission_replied"
            || event_type.ends_with("_answered")
        {
            let request_id = request_id_of(event_type, data)?;
            let response = data
                .get("response")
                .or_else(|| data.get("answer"))
                .cloned();
            return Ok(self.mark_answered(&request_id, response).is_some());
        }
        Ok(false)
    }

    fn create_request(
        &self,
        event_type: &str,
        data: &Value,
        conversation_id: &str,
    ) -> Result<bool, HitlError> {
        let request_id = request_id_of(event_type, data)?;
        let kind = parse_kind(event_type, data)?;
        let created_at = Utc::now();
        let timeout = data
            .get("timeout_seconds")
            .and_then(Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| {
                TimeDelta::try_milliseconds((secs * 1000.0) as i64).unwrap_or(TimeDelta::MAX)
            })
            .unwrap_or(self.default_timeout);
        let timeout_at = created_at
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let request = HitlRequest {
            request_id: request_id.clone(),
            conversation_id: conversation_id.to_string(),
            kind,
            status: HitlStatus::Pending,
            created_at,
            timeout_at,
            answered_at: None,
            response: None,
        };

        let inserted = self.store.set_state(|s| {
            if s.pending_requests.contains_key(&request_id) {
                return false;
            }
            s.insert_pending(request);
            true
        });
        if inserted {
            tracing::info!(
                "HITL {} request {} for conversation {}",
                event_type,
                request_id,
                conversation_id
            );
        } else {
            tracing::debug!("Ignoring duplicate HITL request {}", request_id);
        }
        Ok(inserted)
    }

    fn mark_answered(&self, request_id: &str, response: Option<Value>) -> Option<HitlRequest> {
        let capacity = self.history_capacity;
        let settled = self
            .store
            .set_state(|s| s.settle(request_id, HitlStatus::Answered, response, capacity));
        match &settled {
            Some(_) => tracing::debug!("HITL request {} answered", request_id),
            None => tracing::debug!("HITL answer for unknown request {}", request_id),
        }
        settled
    }

    /// Expire every pending request whose deadline has passed
    pub fn check_timeouts(&self) -> Vec<String> {
        self.check_timeouts_at(Utc::now())
    }

    pub fn check_timeouts_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self.store.with_state(|s| {
            s.pending_requests
                .values()
                .filter(|r| r.is_expired_at(now))
                .map(|r| r.request_id.clone())
                .collect()
        });
        if expired.is_empty() {
            return expired;
        }

        let capacity = self.history_capacity;
        self.store.set_state(|s| {
            for request_id in &expired {
                s.settle(request_id, HitlStatus::Timeout, None, capacity);
            }
        });
        tracing::info!("{} HITL request(s) timed out", expired.len());
        expired
    }

    /// Run [`HitlStore::check_timeouts`] every `interval` on the tokio runtime
    ///
    /// Only one checker may run per store; the returned handle stops it.
    pub fn start_timeout_checker(&self, interval: Duration) -> Result<TimeoutChecker, HitlError> {
        if self
            .checker_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HitlError::CheckerAlreadyRunning);
        }

        let store = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.check_timeouts();
            }
        });
        tracing::debug!("HITL timeout checker started ({:?})", interval);

        Ok(TimeoutChecker {
            handle: Some(handle),
            running: Arc::clone(&self.checker_running),
        })
    }

    /// Send the user's answer; the request stays pending if delivery fails
    pub async fn submit_response(&self, request_id: &str, response: Value) -> Result<(), HitlError> {
        let kind = self
            .store
            .with_state(|s| s.pending_requests.get(request_id).map(|r| r.kind.name()));
        let Some(kind) = kind else {
            let known = self
                .store
                .with_state(|s| s.answered_history.iter().any(|r| r.request_id == request_id));
            return Err(if known {
                HitlError::NotPending(request_id.to_string())
            } else {
                HitlError::RequestNotFound(request_id.to_string())
            });
        };

        if let Err(err) = self.service.respond(request_id, kind, &response).await {
            tracing::warn!(
                "Failed to submit HITL response for {}: {}",
                request_id,
                err.message_or("unknown error")
            );
            return Err(HitlError::Submit(err));
        }

        if self.mark_answered(request_id, Some(response)).is_none() {
            tracing::debug!("HITL request {} settled while the response was in flight", request_id);
        }
        Ok(())
    }

    pub fn get_pending_count(&self, conversation_id: &str) -> usize {
        self.store.with_state(|s| s.pending_count(conversation_id))
    }

    pub fn has_pending(&self, conversation_id: &str) -> bool {
        self.get_pending_count(conversation_id) > 0
    }

    /// Pending requests of one conversation, oldest first
    pub fn get_pending_for_conversation(&self, conversation_id: &str) -> Vec<HitlRequest> {
        self.store.with_state(|s| {
            let mut requests: Vec<HitlRequest> = s
                .requests_by_conversation
                .get(conversation_id)
                .into_iter()
                .flatten()
                .filter_map(|id| s.pending_requests.get(id).cloned())
                .collect();
            requests.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.request_id.cmp(&b.request_id))
            });
            requests
        })
    }

    /// Look a request up in the pending map, then in history
    pub fn get_request(&self, request_id: &str) -> Option<HitlRequest> {
        self.store.with_state(|s| {
            s.pending_requests.get(request_id).cloned().or_else(|| {
                s.answered_history
                    .iter()
                    .find(|r| r.request_id == request_id)
                    .cloned()
            })
        })
    }

    pub fn answered_history(&self) -> Vec<HitlRequest> {
        self.store
            .with_state(|s| s.answered_history.iter().cloned().collect())
    }
}

fn request_id_of(event_type: &str, data: &Value) -> Result<String, HitlError> {
    data.get("request_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HitlError::MalformedEvent {
            event_type: event_type.to_string(),
            reason: "missing request_id".to_string(),
        })
}

/// Build the kind-specific payload from an `*_asked` event
fn parse_kind(event_type: &str, data: &Value) -> Result<HitlRequestKind, HitlError> {
    let malformed = |reason: String| HitlError::MalformedEvent {
        event_type: event_type.to_string(),
        reason,
    };

    let kind = match event_type {
        "clarification_asked" => "clarification",
        "permission_asked" => "permission",
        "decision_asked" => "decision",
        "env_var_requested" => "env_var",
        other => return Err(malformed(format!("unsupported request type {}", other))),
    };

    let mut payload: Map<String, Value> = match data {
        Value::Object(map) => map.clone(),
        _ => return Err(malformed("payload is not an object".to_string())),
    };
    payload.insert("kind".to_string(), Value::String(kind.to_string()));
    serde_json::from_value(Value::Object(payload)).map_err(|e| malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ServiceError;
    use crate::core::traits::ServiceResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingService {
        calls: Mutex<Vec<(String, String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl HitlService for RecordingService {
        async fn respond(
            &self,
            request_id: &str,
            request_kind: &str,
            response: &Value,
        ) -> ServiceResult<()> {
            if self.fail {
                return Err(ServiceError::new("Network Error"));
            }
            self.calls.lock().unwrap().push((
                request_id.to_string(),
                request_kind.to_string(),
                response.clone(),
            ));
            Ok(())
        }
    }

    fn hitl_store() -> HitlStore {
        HitlStore::new(Arc::new(RecordingService::default()), &HitlConfig::default())
    }

    fn decision(request_id: &str) -> Value {
        json!({
            "request_id": request_id,
            "question": "Which database?",
            "options": [{"id": "pg", "label": "Postgres"}]
        })
    }

    #[test]
    fn test_decision_asked_then_answered() {
        let store = hitl_store();
        assert!(store
            .handle_hitl_event("decision_asked", &decision("r1"), "c1")
            .unwrap());
        assert_eq!(store.get_pending_count("c1"), 1);

        assert!(store
            .handle_hitl_event("decision_answered", &json!({"request_id": "r1"}), "c1")
            .unwrap());
        assert_eq!(store.get_pending_count("c1"), 0);

        let state = store.state();
        assert!(state.pending_requests.is_empty());
        assert!(!state.requests_by_conversation.contains_key("c1"));
        assert_eq!(state.answered_history[0].request_id, "r1");
        assert_eq!(state.answered_history[0].status, HitlStatus::Answered);
    }

    #[test]
    fn test_env_var_and_permission_conventions() {
        let store = hitl_store();
        store
            .handle_hitl_event(
                "env_var_requested",
                &json!({
                    "request_id": "e1",
                    "tool_name": "deploy",
                    "fields": [{"name": "API_KEY", "secret": true}]
                }),
                "c1",
            )
            .unwrap();
        store
            .handle_hitl_event(
                "permission_asked",
                &json!({"request_id": "p1", "tool_name": "shell", "action": "rm -rf build"}),
                "c2",
            )
            .unwrap();
        assert_eq!(store.state().total_pending(), 2);

        match &store.get_request("e1").unwrap().kind {
            HitlRequestKind::EnvVar { fields, .. } => assert!(fields[0].required),
            other => panic!("unexpected kind {:?}", other),
        }

        store
            .handle_hitl_event("env_var_provided", &json!({"request_id": "e1"}), "c1")
            .unwrap();
        store
            .handle_hitl_event("permission_replied", &json!({"request_id": "p1"}), "c2")
            .unwrap();
        assert_eq!(store.state().total_pending(), 0);
        assert_eq!(store.answered_history()[0].request_id, "p1");
    }

    #[test]
    fn test_unrelated_and_malformed_events() {
        let store = hitl_store();
        assert!(!store.handle_hitl_event("text_delta", &json!({}), "c1").unwrap());
        assert!(matches!(
            store.handle_hitl_event("decision_asked", &json!({"question": "?"}), "c1"),
            Err(HitlError::MalformedEvent { .. })
        ));
        assert!(matches!(
            store.handle_hitl_event("decision_asked", &json!({"request_id": "r9"}), "c1"),
            Err(HitlError::MalformedEvent { .. })
        ));
        assert!(!store
            .handle_hitl_event("clarification_answered", &json!({"request_id": "nope"}), "c1")
            .unwrap());
    }

    #[test]
    fn test_huge_timeout_saturates_instead_of_overflowing() {
        let store = hitl_store();
        let mut data = decision("r1");
        data["timeout_seconds"] = json!(1e13);
        assert!(store.handle_hitl_event("decision_asked", &data, "c1").unwrap());

        let mut data = decision("r2");
        data["timeout_seconds"] = json!(1e300);
        assert!(store.handle_hitl_event("decision_asked", &data, "c1").unwrap());

        let request = store.get_request("r1").unwrap();
        assert!(request.timeout_at > request.created_at);
        assert_eq!(
            store.get_request("r2").unwrap().timeout_at,
            DateTime::<Utc>::MAX_UTC
        );
        assert!(store.check_timeouts().is_empty());
        assert_eq!(store.get_pending_count("c1"), 2);
    }

    #[test]
    fn test_huge_default_timeout_is_clamped() {
        let config = HitlConfig {
            default_timeout_secs: u64::MAX,
            ..HitlConfig::default()
        };
        let store = HitlStore::new(Arc::new(RecordingService::default()), &config);
        assert!(store.handle_hitl_event("decision_asked", &decision("r1"), "c1").unwrap());
        assert_eq!(
            store.get_request("r1").unwrap().timeout_at,
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_duplicate_asked_is_ignored() {
        let store = hitl_store();
        assert!(store.handle_hitl_event("decision_asked", &decision("r1"), "c1").unwrap());
        assert!(!store.handle_hitl_event("decision_asked", &decision("r1"), "c1").unwrap());
        assert_eq!(store.get_pending_count("c1"), 1);
    }

    #[test]
    fn test_check_timeouts_expires_overdue_requests() {
        let store = hitl_store();
        let mut data = decision("r1");
        data["timeout_seconds"] = json!(30);
        store.handle_hitl_event("decision_asked", &data, "c1").unwrap();
        store.handle_hitl_event("decision_asked", &decision("r2"), "c1").unwrap();

        let expired = store.check_timeouts_at(Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(expired, vec!["r1".to_string()]);

        let state = store.state();
        assert!(!state.pending_requests.contains_key("r1"));
        assert!(state.pending_requests.contains_key("r2"));
        assert_eq!(state.answered_history[0].status, HitlStatus::Timeout);
        assert_eq!(store.get_pending_count("c1"), 1);
    }

    #[test]
    fn test_history_is_bounded_newest_first() {
        let config = HitlConfig {
            history_capacity: 2,
            ..HitlConfig::default()
        };
        let store = HitlStore::new(Arc::new(RecordingService::default()), &config);
        for id in ["r1", "r2", "r3"] {
            store.handle_hitl_event("decision_asked", &decision(id), "c1").unwrap();
            store
                .handle_hitl_event("decision_answered", &json!({"request_id": id}), "c1")
                .unwrap();
        }
        let history: Vec<String> = store
            .answered_history()
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        assert_eq!(history, vec!["r3", "r2"]);
    }

    #[tokio::test]
    async fn test_submit_response_marks_answered() {
        let service = Arc::new(RecordingService::default());
        let store = HitlStore::new(service.clone(), &HitlConfig::default());
        store.handle_hitl_event("decision_asked", &decision("r1"), "c1").unwrap();

        store.submit_response("r1", json!({"choice": "pg"})).await.unwrap();

        let request = store.get_request("r1").unwrap();
        assert_eq!(request.status, HitlStatus::Answered);
        assert_eq!(request.response, Some(json!({"choice": "pg"})));
        assert!(request.answered_at.is_some());
        assert_eq!(service.calls.lock().unwrap()[0].1, "decision");

        assert!(matches!(
            store.submit_response("r1", json!({})).await,
            Err(HitlError::NotPending(_))
        ));
        assert!(matches!(
            store.submit_response("zzz", json!({})).await,
            Err(HitlError::RequestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_submit_leaves_request_pending() {
        let service = RecordingService {
            fail: true,
            ..Default::default()
        };
        let store = HitlStore::new(Arc::new(service), &HitlConfig::default());
        store.handle_hitl_event("decision_asked", &decision("r1"), "c1").unwrap();

        assert!(matches!(
            store.submit_response("r1", json!({})).await,
            Err(HitlError::Submit(_))
        ));
        assert_eq!(store.get_request("r1").unwrap().status, HitlStatus::Pending);
    }

    #[tokio::test]
    async fn test_timeout_checker_runs_once_per_store() {
        let store = hitl_store();
        let mut data = decision("r1");
        data["timeout_seconds"] = json!(0.05);
        store.handle_hitl_event("decision_asked", &data, "c1").unwrap();

        let checker = store.start_timeout_checker(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            store.start_timeout_checker(Duration::from_millis(10)),
            Err(HitlError::CheckerAlreadyRunning)
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get_request("r1").unwrap().status, HitlStatus::Timeout);

        checker.cancel();
        let again = store.start_timeout_checker(Duration::from_millis(10));
        assert!(again.is_ok());
    }
}
