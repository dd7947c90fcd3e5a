//! agent-sync: conversation-state synchronization for agent workspace clients
//!
//! This library provides:
//! - Reactive stores for the timeline, streaming draft, plan execution,
//!   plan mode, conversation list and human-in-the-loop requests
//! - A pure unified-status derivation over those stores
//! - Per-conversation snapshots, send locks and atomic conversation switching
//! - A router that applies server push events to the live stores
//! - Offline replay of recorded push events

pub mod config;
pub mod core;
pub mod events;
pub mod replay;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod subscriptions;
pub mod workspace;

pub use config::Config;
pub use events::{AgentEvent, EventRouter, Routed};
pub use snapshot::{ConversationLocks, ConversationState, ConversationStateMap};
pub use status::{derive_unified_status, StatusDeriver, StatusInputs, UnifiedAgentStatus};
pub use store::{Store, Subscription};
pub use subscriptions::SubscriptionManager;
pub use workspace::{Services, Workspace};
