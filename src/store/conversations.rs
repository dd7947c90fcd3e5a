//! Conversations Store - conversation list and the active conversation

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Store;
use crate::config::ConversationsConfig;
use crate::core::errors::{ConversationStoreError, ServiceError};
use crate::core::traits::ConversationService;
use crate::core::types::Conversation;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationsState {
    pub conversations: Vec<Conversation>,
    pub current_conversation: Option<Conversation>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Raised by `create_conversation`; URL-sync code must not replace the
    /// current conversation until it is cleared
    pub is_new_conversation_pending: bool,
}

impl ConversationsState {
    pub fn current_id(&self) -> Option<&str> {
        self.current_conversation.as_ref().map(|c| c.id.as_str())
    }

    /// Replace a listed conversation and the current copy by id
    fn upsert(&mut self, conversation: &Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => *existing = conversation.clone(),
            None => self.conversations.insert(0, conversation.clone()),
        }
        if self.current_id() == Some(conversation.id.as_str()) {
            self.current_conversation = Some(conversation.clone());
        }
    }
}

#[derive(Clone)]
pub struct ConversationsStore {
    store: Store<ConversationsState>,
    service: Arc<dyn ConversationService>,
    list_limit: usize,
}

impl std::fmt::Debug for ConversationsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationsStore")
            .field("store", &self.store)
            .field("list_limit", &self.list_limit)
            .finish_non_exhaustive()
    }
}

impl ConversationsStore {
    pub fn new(service: Arc<dyn ConversationService>, config: &ConversationsConfig) -> Self {
        Self {
            store: Store::new("conversations", ConversationsState::default()),
            service,
            list_limit: config.list_limit,
        }
    }

    pub fn store(&self) -> &Store<ConversationsState> {
        &self.store
    }

    pub fn state(&self) -> ConversationsState {
        self.store.get_state()
    }

    /// Load the conversation list for a project
    ///
    /// Returns `Ok(false)` without a request while a list is already loading.
    pub async fn list_conversations(&self, project_id: &str) -> Result<bool, ConversationStoreError> {
        let started = self.store.set_state_quiet(|s| {
            if s.is_loading {
                return false;
            }
            s.is_loading = true;
            s.error = None;
            true
        });
        if !started {
            tracing::debug!("list_conversations skipped: already loading");
            return Ok(false);
        }
        self.store.notify();

        let result = self
            .service
            .list_conversations(project_id, self.list_limit, 0)
            .await;

        match result {
            Ok(conversations) => {
                tracing::debug!(
                    "Loaded {} conversations for project {}",
                    conversations.len(),
                    project_id
                );
                self.store.set_state(|s| {
                    let fresh = s
                        .current_id()
                        .and_then(|id| conversations.iter().find(|c| c.id == id))
                        .cloned();
                    if fresh.is_some() {
                        s.current_conversation = fresh;
                    }
                    s.conversations = conversations;
                    s.is_loading = false;
                });
                Ok(true)
            }
            Err(err) => {
                let message = err.message_or("Failed to load conversations");
                tracing::warn!("Conversation list failed: {}", message);
                self.store.set_state(|s| {
                    s.is_loading = false;
                    s.error = Some(message);
                });
                Err(err.into())
            }
        }
    }

    /// Create a conversation, prepend it and make it current
    pub async fn create_conversation(
        &self,
        project_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation, ConversationStoreError> {
        match self.service.create_conversation(project_id, title).await {
            Ok(conversation) => {
                tracing::info!("Created conversation {}", conversation.id);
                self.store.set_state(|s| {
                    s.conversations.retain(|c| c.id != conversation.id);
                    s.conversations.insert(0, conversation.clone());
                    s.current_conversation = Some(conversation.clone());
                    s.is_new_conversation_pending = true;
                    s.error = None;
                });
                Ok(conversation)
            }
            Err(err) => Err(self.record_error(err, "Failed to create conversation")),
        }
    }

    /// Fetch one conversation and merge it into the list
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> Result<Conversation, ConversationStoreError> {
        match self
            .service
            .get_conversation(conversation_id, project_id)
            .await
        {
            Ok(conversation) => {
                self.store.set_state(|s| s.upsert(&conversation));
                Ok(conversation)
            }
            Err(err) => Err(self.record_error(err, "Failed to load conversation")),
        }
    }

    /// Delete a conversation; the current conversation is cleared only if it
    /// is the one deleted
    pub async fn delete_conversation(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> Result<(), ConversationStoreError> {
        match self
            .service
            .delete_conversation(conversation_id, project_id)
            .await
        {
            Ok(()) => {
                tracing::info!("Deleted conversation {}", conversation_id);
                self.store.set_state(|s| {
                    s.conversations.retain(|c| c.id != conversation_id);
                    if s.current_id() == Some(conversation_id) {
                        s.current_conversation = None;
                    }
                });
                Ok(())
            }
            Err(err) => Err(self.record_error(err, "Failed to delete conversation")),
        }
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        project_id: &str,
        title: &str,
    ) -> Result<Conversation, ConversationStoreError> {
        match self
            .service
            .update_title(conversation_id, project_id, title)
            .await
        {
            Ok(conversation) => {
                self.store.set_state(|s| s.upsert(&conversation));
                Ok(conversation)
            }
            Err(err) => Err(self.record_error(err, "Failed to rename conversation")),
        }
    }

    /// Ask the service to title a conversation
    ///
    /// Best effort: failures are logged and never reach the store's error.
    pub async fn generate_conversation_title(
        &self,
        conversation_id: &str,
        project_id: &str,
    ) -> Option<Conversation> {
        match self
            .service
            .generate_title(conversation_id, project_id)
            .await
        {
            Ok(conversation) => {
                tracing::debug!(
                    "Generated title for {}: {}",
                    conversation.id,
                    conversation.title
                );
                self.store.set_state(|s| s.upsert(&conversation));
                Some(conversation)
            }
            Err(err) => {
                tracing::warn!(
                    "Title generation failed for {}: {}",
                    conversation_id,
                    err.message_or("unknown error")
                );
                None
            }
        }
    }

    pub fn set_current_conversation(&self, conversation: Option<Conversation>) {
        self.store.set_state(|s| s.current_conversation = conversation);
    }

    /// Make a listed conversation current
    pub fn select_conversation(&self, conversation_id: &str) -> Result<(), ConversationStoreError> {
        self.store.set_state(|s| {
            let found = s
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .cloned()
                .ok_or_else(|| ConversationStoreError::NotFound(conversation_id.to_string()))?;
            s.current_conversation = Some(found);
            Ok(())
        })
    }

    pub fn clear_new_conversation_pending(&self) {
        self.store.set_state(|s| s.is_new_conversation_pending = false);
    }

    fn record_error(
        &self,
        err: ServiceError,
        fallback: &str,
    ) -> ConversationStoreError {
        let message = err.message_or(fallback);
        tracing::warn!("{}: {}", fallback, message);
        self.store.set_state(|s| s.error = Some(message));
        err.into()
    }
}
