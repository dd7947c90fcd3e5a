//! Collaborator traits for the state layer
//!
//! The stores never talk to the network directly. These traits are the
//! request/response seams the HTTP clients implement, allowing tests to inject
//! in-memory services.

use async_trait::async_trait;
use serde_json::Value;

use super::errors::ServiceError;
use super::types::{Conversation, PlanDocument, PlanModeStatus, PlanUpdate, TimelinePage};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Conversation-message service: paginated access to a conversation's timeline
#[async_trait]
pub trait TimelineService: Send + Sync {
    /// Fetch up to `limit` events. With `before_sequence`, only events strictly
    /// older than that cursor are returned (backward pagination).
    async fn fetch_timeline(
        &self,
        conversation_id: &str,
        project_id: &str,
        limit: usize,
        before_sequence: Option<i64>,
    ) -> ServiceResult<TimelinePage>;
}

/// Conversation CRUD service
#[async_trait]
pub trait ConversationService: Send + Sync {
    async fn list_conversations(
        &self,
        project_id: &str,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<Vec<Conversation>>;

    async fn create_conversation(
        &self,
        project_id: &str,
        title: Option<&str>,
    ) -> ServiceResult<Conversation>;

    async fn get_conversation(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> ServiceResult<Conversation>;

    async fn delete_conversation(&self, conversation_id: &str, project_id: &str)
        -> ServiceResult<()>;

    async fn update_title(
        &self,
        conversation_id: &str,
        project_id: &str,
        title: &str,
    ) -> ServiceResult<Conversation>;

    async fn generate_title(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> ServiceResult<Conversation>;
}

/// Plan-mode service
#[async_trait]
pub trait PlanService: Send + Sync {
    async fn enter_plan_mode(
        &self,
        conversation_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> ServiceResult<PlanDocument>;

    async fn exit_plan_mode(&self, conversation_id: &str, plan_id: &str) -> ServiceResult<()>;

    async fn get_plan(&self, plan_id: &str) -> ServiceResult<PlanDocument>;

    async fn update_plan(&self, plan_id: &str, update: &PlanUpdate)
        -> ServiceResult<PlanDocument>;

    async fn get_plan_mode_status(&self, conversation_id: &str) -> ServiceResult<PlanModeStatus>;

    async fn submit_plan_for_review(&self, plan_id: &str) -> ServiceResult<PlanDocument>;

    async fn approve_plan(&self, plan_id: &str) -> ServiceResult<PlanDocument>;

    async fn reject_plan(&self, plan_id: &str, reason: Option<&str>)
        -> ServiceResult<PlanDocument>;
}

/// HITL response service
#[async_trait]
pub trait HitlService: Send + Sync {
    /// Deliver the user's answer for `request_id`
    async fn respond(
        &self,
        request_id: &str,
        request_kind: &str,
        response: &Value,
    ) -> ServiceResult<()>;
}
