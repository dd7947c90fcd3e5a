//! Per-conversation snapshots and send locks
//!
//! The stores are the live projection of exactly one [`ConversationState`].
//! Inactive conversations live here as plain values until they are switched
//! back in.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::SwitchError;
use crate::store::{ExecutionState, StreamingState, TimelineState};

/// Saved state of one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub streaming: StreamingState,
    pub execution: ExecutionState,
    pub timeline: TimelineState,
    /// Unsent input text
    pub draft: String,
    pub has_pending_hitl: bool,
    pub last_accessed_at: DateTime<Utc>,
}

/// Partial update for [`merge_conversation_state`]; `None` keeps the field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStatePatch {
    pub streaming: Option<StreamingState>,
    pub execution: Option<ExecutionState>,
    pub timeline: Option<TimelineState>,
    pub draft: Option<String>,
    pub has_pending_hitl: Option<bool>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

pub fn create_default_conversation_state(conversation_id: &str) -> ConversationState {
    ConversationState {
        conversation_id: conversation_id.to_string(),
        streaming: StreamingState::default(),
        execution: ExecutionState::default(),
        timeline: TimelineState {
            conversation_id: Some(conversation_id.to_string()),
            ..TimelineState::default()
        },
        draft: String::new(),
        has_pending_hitl: false,
        last_accessed_at: Utc::now(),
    }
}

pub fn merge_conversation_state(
    state: &ConversationState,
    patch: ConversationStatePatch,
) -> ConversationState {
    ConversationState {
        conversation_id: state.conversation_id.clone(),
        streaming: patch.streaming.unwrap_or_else(|| state.streaming.clone()),
        execution: patch.execution.unwrap_or_else(|| state.execution.clone()),
        timeline: patch.timeline.unwrap_or_else(|| state.timeline.clone()),
        draft: patch.draft.unwrap_or_else(|| state.draft.clone()),
        has_pending_hitl: patch.has_pending_hitl.unwrap_or(state.has_pending_hitl),
        last_accessed_at: patch.last_accessed_at.unwrap_or(state.last_accessed_at),
    }
}

pub fn touch(state: &ConversationState, now: DateTime<Utc>) -> ConversationState {
    merge_conversation_state(
        state,
        ConversationStatePatch {
            last_accessed_at: Some(now),
            ..Default::default()
        },
    )
}

/// "Send in flight" flags per conversation, independent of which one is live
#[derive(Debug, Clone, Default)]
pub struct ConversationLocks {
    locked: Arc<Mutex<HashSet<String>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, conversation_id: &str) -> Result<(), SwitchError> {
        if !self.lock().insert(conversation_id.to_string()) {
            return Err(SwitchError::SendInFlight(conversation_id.to_string()));
        }
        tracing::debug!("Send lock acquired for {}", conversation_id);
        Ok(())
    }

    /// Returns whether a lock was held
    pub fn release(&self, conversation_id: &str) -> bool {
        let released = self.lock().remove(conversation_id);
        if released {
            tracing::debug!("Send lock released for {}", conversation_id);
        }
        released
    }

    pub fn is_locked(&self, conversation_id: &str) -> bool {
        self.lock().contains(conversation_id)
    }

    pub fn locked_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.locked.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Conversation lock map was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Snapshots of inactive conversations with LRU eviction
#[derive(Debug, Clone)]
pub struct ConversationStateMap {
    entries: HashMap<String, ConversationState>,
    capacity: usize,
}

impl ConversationStateMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Store a snapshot, evicting least recently accessed entries over
    /// capacity; locked conversations are never evicted
    ///
    /// Returns the evicted conversation ids.
    pub fn insert(&mut self, state: ConversationState, locks: &ConversationLocks) -> Vec<String> {
        self.entries.insert(state.conversation_id.clone(), state);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .values()
                .filter(|s| !locks.is_locked(&s.conversation_id))
                .min_by_key(|s| s.last_accessed_at)
                .map(|s| s.conversation_id.clone());
            let Some(victim) = victim else {
                tracing::debug!("All cached conversations are locked; cache over capacity");
                break;
            };
            self.entries.remove(&victim);
            tracing::debug!("Evicted conversation snapshot {}", victim);
            evicted.push(victim);
        }
        evicted
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationState> {
        self.entries.get(conversation_id)
    }

    pub fn take(&mut self, conversation_id: &str) -> Option<ConversationState> {
        self.entries.remove(conversation_id)
    }

    /// Apply a patch to a cached snapshot
    pub fn update(&mut self, conversation_id: &str, patch: ConversationStatePatch) -> bool {
        match self.entries.get_mut(conversation_id) {
            Some(state) => {
                *state = merge_conversation_state(state, patch);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.entries.contains_key(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
