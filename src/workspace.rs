//! Workspace - the live stores plus the cache of inactive conversations
//!
//! Exactly one conversation is live at a time. [`Workspace::switch_conversation`]
//! saves the outgoing conversation, resets the stores and restores the
//! incoming one under a single lock, and only then notifies subscribers, so no
//! listener ever observes a mix of two conversations.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::config::Config;
use crate::core::errors::{SwitchError, TimelineError};
use crate::core::traits::{ConversationService, HitlService, PlanService, TimelineService};
use crate::core::types::LifecycleData;
use crate::snapshot::{
    create_default_conversation_state, touch, ConversationLocks, ConversationState,
    ConversationStateMap, ConversationStatePatch,
};
use crate::status::{StatusDeriver, StatusInputs, UnifiedAgentStatus};
use crate::store::{
    ConversationsStore, ExecutionState, ExecutionStore, HitlState, HitlStore, PlanModeState,
    PlanModeStore, Store, StreamingState, StreamingStore, Subscription, TimelineLoad,
    TimelineStore,
};
use crate::subscriptions::SubscriptionManager;

/// Collaborators the workspace stores talk to
#[derive(Clone)]
pub struct Services {
    pub timeline: Arc<dyn TimelineService>,
    pub conversations: Arc<dyn ConversationService>,
    pub plans: Arc<dyn PlanService>,
    pub hitl: Arc<dyn HitlService>,
}

/// Lifecycle and sandbox data pushed by the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConnection {
    pub lifecycle: Option<LifecycleData>,
    pub sandbox_id: Option<String>,
}

struct WorkspaceInner {
    live: Option<String>,
    draft: String,
    cache: ConversationStateMap,
    deriver: StatusDeriver,
}

/// Set of status listeners registered under one key
pub struct StatusWatch {
    _subscriptions: Vec<Subscription>,
}

#[derive(Clone)]
pub struct Workspace {
    pub timeline: TimelineStore,
    pub streaming: StreamingStore,
    pub execution: ExecutionStore,
    pub plan_mode: PlanModeStore,
    pub conversations: ConversationsStore,
    pub hitl: HitlStore,
    pub connection: Store<AgentConnection>,
    locks: ConversationLocks,
    watches: SubscriptionManager<StatusWatch>,
    inner: Arc<Mutex<WorkspaceInner>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("live", &self.live_conversation_id())
            .field("locks", &self.locks)
            .field("watches", &self.watches)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn new(services: Services, config: &Config) -> Self {
        Self {
            timeline: TimelineStore::new(services.timeline, &config.timeline),
            streaming: StreamingStore::new(),
            execution: ExecutionStore::new(),
            plan_mode: PlanModeStore::new(services.plans),
            conversations: ConversationsStore::new(services.conversations, &config.conversations),
            hitl: HitlStore::new(services.hitl, &config.hitl),
            connection: Store::new("connection", AgentConnection::default()),
            locks: ConversationLocks::new(),
            watches: SubscriptionManager::new(),
            inner: Arc::new(Mutex::new(WorkspaceInner {
                live: None,
                draft: String::new(),
                cache: ConversationStateMap::new(config.workspace.max_cached_conversations),
                deriver: StatusDeriver::new(),
            })),
        }
    }

    pub fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    pub fn live_conversation_id(&self) -> Option<String> {
        self.lock().live.clone()
    }

    pub fn is_live(&self, conversation_id: &str) -> bool {
        self.lock().live.as_deref() == Some(conversation_id)
    }

    /// Make `incoming` the live conversation
    ///
    /// Snapshot-save, reset and restore happen under one lock with store
    /// notifications deferred until every store holds the incoming state.
    pub fn switch_conversation(&self, incoming: &str) -> Result<(), SwitchError> {
        {
            let mut inner = self.lock();
            if inner.live.as_deref() == Some(incoming) {
                return Err(SwitchError::AlreadyLive(incoming.to_string()));
            }

            let now = Utc::now();
            if let Some(outgoing) = inner.live.take() {
                let snapshot = self.capture(&outgoing, std::mem::take(&mut inner.draft));
                let evicted = inner.cache.insert(snapshot, &self.locks);
                if !evicted.is_empty() {
                    tracing::debug!("Evicted snapshots: {:?}", evicted);
                }
            }

            let state = match inner.cache.take(incoming) {
                Some(saved) => touch(&saved, now),
                None => create_default_conversation_state(incoming),
            };

            self.timeline.restore_quiet(state.timeline);
            self.streaming.restore_quiet(state.streaming);
            self.execution.restore_quiet(state.execution);
            self.plan_mode.clear_quiet();
            inner.draft = state.draft;
            inner.live = Some(incoming.to_string());
        }

        self.timeline.store().notify();
        self.streaming.store().notify();
        self.execution.store().notify();
        self.plan_mode.store().notify();
        tracing::info!("Switched live conversation to {}", incoming);
        Ok(())
    }

    /// Snapshot of a conversation: the live stores or the cached copy
    pub fn conversation_state(&self, conversation_id: &str) -> Option<ConversationState> {
        let inner = self.lock();
        if inner.live.as_deref() == Some(conversation_id) {
            return Some(self.capture(conversation_id, inner.draft.clone()));
        }
        inner.cache.get(conversation_id).cloned()
    }

    /// Re-read the pending HITL flag of a cached conversation.
    /// Returns `false` when the conversation has no snapshot.
    pub fn refresh_pending_hitl(&self, conversation_id: &str) -> bool {
        let has_pending_hitl = self.hitl.has_pending(conversation_id);
        self.lock().cache.update(
            conversation_id,
            ConversationStatePatch {
                has_pending_hitl: Some(has_pending_hitl),
                ..Default::default()
            },
        )
    }

    pub fn cached_conversations(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn set_draft(&self, draft: impl Into<String>) {
        self.lock().draft = draft.into();
    }

    pub fn draft(&self) -> String {
        self.lock().draft.clone()
    }

    /// Load the newest timeline page of the live conversation
    pub async fn load_live_timeline(&self, project_id: &str) -> Result<TimelineLoad, TimelineError> {
        let Some(conversation_id) = self.live_conversation_id() else {
            tracing::debug!("load_live_timeline without a live conversation");
            return Ok(TimelineLoad::Stale);
        };
        self.timeline.get_timeline(&conversation_id, project_id).await
    }

    /// Mark a send in flight for the live conversation and open its stream
    pub fn begin_send(&self, conversation_id: &str) -> Result<(), SwitchError> {
        self.locks.acquire(conversation_id)?;
        if self.is_live(conversation_id) {
            if let Err(err) = self.streaming.begin(None) {
                tracing::debug!("Stream already open for {}: {}", conversation_id, err);
            }
        }
        Ok(())
    }

    pub fn end_send(&self, conversation_id: &str) -> bool {
        self.locks.release(conversation_id)
    }

    pub fn set_lifecycle(&self, lifecycle: LifecycleData) {
        self.connection.set_state(|c| c.lifecycle = Some(lifecycle));
    }

    pub fn set_sandbox(&self, sandbox_id: Option<String>) {
        self.connection.set_state(|c| c.sandbox_id = sandbox_id);
    }

    pub fn unified_status(&self) -> UnifiedAgentStatus {
        let connection = self.connection.get_state();
        let pending_hitl = self
            .live_conversation_id()
            .map_or(0, |id| self.hitl.get_pending_count(&id));
        let inputs = StatusInputs::collect(
            connection.lifecycle.as_ref(),
            &self.execution.state(),
            &self.plan_mode.state(),
            &self.streaming.state(),
            pending_hitl,
            connection.sandbox_id.as_deref(),
        );
        self.lock().deriver.derive(inputs)
    }

    /// Call `listener` whenever the unified status changes
    ///
    /// Watches are shared by key: only the first watcher of a key registers
    /// listeners. Returns `true` when this call registered them.
    pub fn watch_status(
        &self,
        key: &str,
        listener: impl Fn(&UnifiedAgentStatus) + Send + Sync + 'static,
    ) -> bool {
        self.watches.acquire(key, || {
            let last = Mutex::new(self.unified_status());
            let workspace = self.clone();
            let on_change: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                let status = workspace.unified_status();
                let mut last = last.lock().unwrap_or_else(|p| p.into_inner());
                if *last != status {
                    *last = status.clone();
                    drop(last);
                    listener(&status);
                }
            });
            StatusWatch {
                _subscriptions: vec![
                    self.streaming.store().subscribe(forward::<StreamingState>(&on_change)),
                    self.execution.store().subscribe(forward::<ExecutionState>(&on_change)),
                    self.plan_mode.store().subscribe(forward::<PlanModeState>(&on_change)),
                    self.hitl.store().subscribe(forward::<HitlState>(&on_change)),
                    self.connection.subscribe(forward::<AgentConnection>(&on_change)),
                ],
            }
        })
    }

    pub fn unwatch_status(&self, key: &str) -> bool {
        self.watches.release(key)
    }

    fn capture(&self, conversation_id: &str, draft: String) -> ConversationState {
        ConversationState {
            conversation_id: conversation_id.to_string(),
            streaming: self.streaming.snapshot(),
            execution: self.execution.snapshot(),
            timeline: self.timeline.snapshot(),
            draft,
            has_pending_hitl: self.hitl.has_pending(conversation_id),
            last_accessed_at: Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkspaceInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Workspace lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn forward<S: 'static>(
    on_change: &Arc<dyn Fn() + Send + Sync>,
) -> impl Fn(&S) + Send + Sync + 'static {
    let on_change = Arc::clone(on_change);
    move |_: &S| on_change()
}
