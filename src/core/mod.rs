//! Core domain modules
//!
//! Types, errors and collaborator traits shared by the stores, the event router
//! and the snapshot model.

pub mod errors;
pub mod traits;
pub mod types;

pub use errors::{
    ConversationStoreError, EventError, HitlError, PlanModeError, ServiceError, StreamingError,
    SwitchError, TimelineError,
};
pub use traits::{ConversationService, HitlService, PlanService, ServiceResult, TimelineService};
pub use types::*;
