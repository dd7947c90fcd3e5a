//! Plan-Mode Store - plan document and build/plan/explore status
//!
//! A request/response wrapper over [`PlanService`]. Every action follows the
//! same shape: raise `is_loading`, call the service, store the returned
//! document, record the extracted error message on failure, clear
//! `is_loading` in all cases and hand the error back to the caller. Nothing is
//! updated optimistically beyond the document the service returns.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Store;
use crate::core::errors::PlanModeError;
use crate::core::traits::{PlanService, ServiceResult};
use crate::core::types::{AgentMode, PlanDocument, PlanModeStatus, PlanUpdate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanModeState {
    pub current_plan: Option<PlanDocument>,
    pub plan_mode_status: PlanModeStatus,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl PlanModeState {
    pub fn current_mode(&self) -> AgentMode {
        self.plan_mode_status.current_mode
    }

    pub fn is_in_plan_mode(&self) -> bool {
        self.plan_mode_status.is_in_plan_mode
    }

    /// Keep the cached document and the status copy in step
    fn store_plan(&mut self, plan: &PlanDocument) {
        if let Some(status_plan) = self.plan_mode_status.plan.as_mut() {
            if status_plan.id == plan.id {
                *status_plan = plan.clone();
            }
        }
        self.current_plan = Some(plan.clone());
    }
}

#[derive(Clone)]
pub struct PlanModeStore {
    store: Store<PlanModeState>,
    service: Arc<dyn PlanService>,
}

impl std::fmt::Debug for PlanModeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanModeStore")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PlanModeStore {
    pub fn new(service: Arc<dyn PlanService>) -> Self {
        Self {
            store: Store::new("plan_mode", PlanModeState::default()),
            service,
        }
    }

    pub fn store(&self) -> &Store<PlanModeState> {
        &self.store
    }

    pub fn state(&self) -> PlanModeState {
        self.store.get_state()
    }

    /// Enter plan mode, creating a draft plan document
    pub async fn enter_plan_mode(
        &self,
        conversation_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<PlanDocument, PlanModeError> {
        let plan = self
            .run(
                "Failed to enter plan mode",
                self.service.enter_plan_mode(conversation_id, title, description),
                |s, plan: &PlanDocument| {
                    s.plan_mode_status = PlanModeStatus {
                        is_in_plan_mode: true,
                        current_mode: AgentMode::Plan,
                        current_plan_id: Some(plan.id.clone()),
                        plan: Some(plan.clone()),
                    };
                    s.current_plan = Some(plan.clone());
                },
            )
            .await?;
        tracing::info!("Entered plan mode for {} with plan {}", conversation_id, plan.id);
        Ok(plan)
    }

    /// Leave plan mode and return to build mode
    pub async fn exit_plan_mode(
        &self,
        conversation_id: &str,
        plan_id: &str,
    ) -> Result<(), PlanModeError> {
        self.run(
            "Failed to exit plan mode",
            self.service.exit_plan_mode(conversation_id, plan_id),
            |s, _: &()| {
                s.plan_mode_status = PlanModeStatus::default();
                s.current_plan = None;
            },
        )
        .await?;
        tracing::info!("Exited plan mode for {}", conversation_id);
        Ok(())
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<PlanDocument, PlanModeError> {
        self.run("Failed to load plan", self.service.get_plan(plan_id), |s, plan| {
            s.store_plan(plan)
        })
        .await
    }

    pub async fn update_plan(
        &self,
        plan_id: &str,
        update: &PlanUpdate,
    ) -> Result<PlanDocument, PlanModeError> {
        self.run(
            "Failed to update plan",
            self.service.update_plan(plan_id, update),
            |s, plan| s.store_plan(plan),
        )
        .await
    }

    /// Update whichever plan is currently loaded
    pub async fn update_current_plan(
        &self,
        update: &PlanUpdate,
    ) -> Result<PlanDocument, PlanModeError> {
        let plan_id = self.current_plan_id().ok_or(PlanModeError::NoPlan)?;
        self.update_plan(&plan_id, update).await
    }

    /// Refresh the plan-mode status
    ///
    /// A response without a plan drops the cached document only when plan
    /// mode is off.
    pub async fn get_plan_mode_status(
        &self,
        conversation_id: &str,
    ) -> Result<PlanModeStatus, PlanModeError> {
        self.run(
            "Failed to load plan mode status",
            self.service.get_plan_mode_status(conversation_id),
            |s, status: &PlanModeStatus| {
                if let Some(plan) = status.plan.as_ref() {
                    s.current_plan = Some(plan.clone());
                } else if !status.is_in_plan_mode {
                    s.current_plan = None;
                }
                s.plan_mode_status = status.clone();
            },
        )
        .await
    }

    pub async fn submit_plan_for_review(
        &self,
        plan_id: &str,
    ) -> Result<PlanDocument, PlanModeError> {
        self.run(
            "Failed to submit plan for review",
            self.service.submit_plan_for_review(plan_id),
            |s, plan| s.store_plan(plan),
        )
        .await
    }

    pub async fn approve_plan(&self, plan_id: &str) -> Result<PlanDocument, PlanModeError> {
        self.run(
            "Failed to approve plan",
            self.service.approve_plan(plan_id),
            |s, plan| s.store_plan(plan),
        )
        .await
    }

    pub async fn reject_plan(
        &self,
        plan_id: &str,
        reason: Option<&str>,
    ) -> Result<PlanDocument, PlanModeError> {
        self.run(
            "Failed to reject plan",
            self.service.reject_plan(plan_id, reason),
            |s, plan| s.store_plan(plan),
        )
        .await
    }

    /// Local mode switch; plan documents are only created by `enter_plan_mode`
    ///
    /// Returns the previous mode.
    pub fn switch_mode(&self, mode: AgentMode) -> AgentMode {
        self.store.set_state(|s| {
            let previous = s.plan_mode_status.current_mode;
            s.plan_mode_status.current_mode = mode;
            s.plan_mode_status.is_in_plan_mode = mode == AgentMode::Plan;
            tracing::debug!("Agent mode {} -> {}", previous, mode);
            previous
        })
    }

    pub fn clear_plan_state(&self) {
        self.store.replace(PlanModeState::default());
    }

    pub(crate) fn clear_quiet(&self) {
        self.store.set_state_quiet(|s| *s = PlanModeState::default());
    }

    pub fn current_plan_id(&self) -> Option<String> {
        self.store.with_state(|s| {
            s.current_plan
                .as_ref()
                .map(|p| p.id.clone())
                .or_else(|| s.plan_mode_status.current_plan_id.clone())
        })
    }

    async fn run<T>(
        &self,
        fallback: &str,
        call: impl Future<Output = ServiceResult<T>>,
        apply: impl FnOnce(&mut PlanModeState, &T),
    ) -> Result<T, PlanModeError> {
        self.store.set_state(|s| {
            s.is_loading = true;
            s.error = None;
        });

        let result = call.await;

        self.store.set_state(|s| {
            s.is_loading = false;
            match &result {
                Ok(value) => apply(s, value),
                Err(err) => {
                    let message = err.message_or(fallback);
                    tracing::warn!("{}: {}", fallback, message);
                    s.error = Some(message);
                }
            }
        });
        result.map_err(PlanModeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ServiceError;
    use crate::core::types::PlanDocumentStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    fn plan(id: &str, status: PlanDocumentStatus, version: u32) -> PlanDocument {
        PlanDocument {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            title: "Refactor".to_string(),
            content: String::new(),
            status,
            version,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct MockPlanService {
        fail_with: Mutex<Option<ServiceError>>,
    }

    impl MockPlanService {
        fn failing(err: ServiceError) -> Self {
            Self {
                fail_with: Mutex::new(Some(err)),
            }
        }

        fn check(&self) -> ServiceResult<()> {
            match self.fail_with.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl PlanService for MockPlanService {
        async fn enter_plan_mode(
            &self,
            _conversation_id: &str,
            _title: &str,
            _description: Option<&str>,
        ) -> ServiceResult<PlanDocument> {
            self.check()?;
            Ok(plan("p1", PlanDocumentStatus::Draft, 1))
        }

        async fn exit_plan_mode(&self, _conversation_id: &str, _plan_id: &str) -> ServiceResult<()> {
            self.check()
        }

        async fn get_plan(&self, plan_id: &str) -> ServiceResult<PlanDocument> {
            self.check()?;
            Ok(plan(plan_id, PlanDocumentStatus::Draft, 1))
        }

        async fn update_plan(
            &self,
            plan_id: &str,
            update: &PlanUpdate,
        ) -> ServiceResult<PlanDocument> {
            self.check()?;
            let mut doc = plan(plan_id, PlanDocumentStatus::Draft, 2);
            if let Some(content) = &update.content {
                doc.content = content.clone();
            }
            Ok(doc)
        }

        async fn get_plan_mode_status(&self, _conversation_id: &str) -> ServiceResult<PlanModeStatus> {
            self.check()?;
            Ok(PlanModeStatus::default())
        }

        async fn submit_plan_for_review(&self, plan_id: &str) -> ServiceResult<PlanDocument> {
            self.check()?;
            Ok(plan(plan_id, PlanDocumentStatus::Reviewing, 2))
        }

        async fn approve_plan(&self, plan_id: &str) -> ServiceResult<PlanDocument> {
            self.check()?;
            Ok(plan(plan_id, PlanDocumentStatus::Approved, 2))
        }

        async fn reject_plan(
            &self,
            plan_id: &str,
            _reason: Option<&str>,
        ) -> ServiceResult<PlanDocument> {
            self.check()?;
            Ok(plan(plan_id, PlanDocumentStatus::Rejected, 2))
        }
    }

    #[tokio::test]
    async fn test_enter_plan_mode_synthesizes_status() {
        let store = PlanModeStore::new(Arc::new(MockPlanService::default()));
        let doc = store.enter_plan_mode("c1", "Refactor", None).await.unwrap();

        let state = store.state();
        assert!(!state.is_loading);
        assert!(state.is_in_plan_mode());
        assert_eq!(state.current_mode(), AgentMode::Plan);
        assert_eq!(state.plan_mode_status.current_plan_id.as_deref(), Some("p1"));
        assert_eq!(state.current_plan, Some(doc));
    }

    #[tokio::test]
    async fn test_exit_plan_mode_returns_to_build() {
        let store = PlanModeStore::new(Arc::new(MockPlanService::default()));
        store.enter_plan_mode("c1", "Refactor", None).await.unwrap();
        store.exit_plan_mode("c1", "p1").await.unwrap();

        let state = store.state();
        assert!(!state.is_in_plan_mode());
        assert_eq!(state.current_mode(), AgentMode::Build);
        assert!(state.current_plan.is_none());
    }

    #[tokio::test]
    async fn test_failure_records_detail_and_clears_loading() {
        let service = MockPlanService::failing(ServiceError::with_detail(409, "Plan locked"));
        let store = PlanModeStore::new(Arc::new(service));

        let err = store.approve_plan("p1").await.unwrap_err();
        assert!(matches!(err, PlanModeError::Service(_)));

        let state = store.state();
        assert!(!state.is_loading);
        assert_eq!(state.error.as_deref(), Some("Plan locked"));
        assert!(state.current_plan.is_none());
    }

    #[tokio::test]
    async fn test_failure_uses_fallback_when_message_blank() {
        let service = MockPlanService::failing(ServiceError::new(""));
        let store = PlanModeStore::new(Arc::new(service));

        assert!(store.get_plan("p1").await.is_err());
        assert_eq!(store.state().error.as_deref(), Some("Failed to load plan"));
    }

    #[tokio::test]
    async fn test_review_cycle_updates_status_copy() {
        let store = PlanModeStore::new(Arc::new(MockPlanService::default()));
        store.enter_plan_mode("c1", "Refactor", None).await.unwrap();
        store.submit_plan_for_review("p1").await.unwrap();
        store.approve_plan("p1").await.unwrap();

        let state = store.state();
        assert_eq!(
            state.current_plan.as_ref().unwrap().status,
            PlanDocumentStatus::Approved
        );
        assert_eq!(
            state.plan_mode_status.plan.as_ref().unwrap().status,
            PlanDocumentStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_update_current_plan_without_plan() {
        let store = PlanModeStore::new(Arc::new(MockPlanService::default()));
        let update = PlanUpdate {
            content: Some("steps".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            store.update_current_plan(&update).await,
            Err(PlanModeError::NoPlan)
        ));

        store.enter_plan_mode("c1", "Refactor", None).await.unwrap();
        let doc = store.update_current_plan(&update).await.unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.content, "steps");
    }

    #[tokio::test]
    async fn test_status_default_means_build_mode() {
        let store = PlanModeStore::new(Arc::new(MockPlanService::default()));
        let status = store.get_plan_mode_status("c1").await.unwrap();
        assert!(!status.is_in_plan_mode);
        assert_eq!(status.current_mode, AgentMode::Build);
    }

    #[test]
    fn test_switch_mode_is_local() {
        let store = PlanModeStore::new(Arc::new(MockPlanService::default()));
        assert_eq!(store.switch_mode(AgentMode::Explore), AgentMode::Build);
        assert_eq!(store.state().current_mode(), AgentMode::Explore);
        assert!(!store.state().is_in_plan_mode());

        store.switch_mode(AgentMode::Plan);
        assert!(store.state().is_in_plan_mode());

        store.clear_plan_state();
        assert_eq!(store.state(), PlanModeState::default());
    }
}
