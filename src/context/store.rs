//! Persistence of conversation-level context settings
//!
//! Only settings are written by this crate. Writes replace the whole
//! settings record for a conversation, so concurrent writers resolve as
//! last-writer-wins.

use dashmap::DashMap;

use super::models::{Conversation, ConversationSettings};
use crate::error::{ContextError, Result};

pub trait ConversationStore: Send + Sync {
    /// Current settings for a conversation
    fn load_settings(&self, conversation_id: &str) -> Result<ConversationSettings>;

    /// Replace the settings of a conversation
    fn save_settings(&self, conversation_id: &str, settings: ConversationSettings) -> Result<()>;
}

/// Concurrent in-memory settings store
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    settings: DashMap<String, ConversationSettings>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversation with its current settings
    pub fn register(&self, conversation: &Conversation) {
        self.settings
            .insert(conversation.id.clone(), conversation.settings.clone());
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn load_settings(&self, conversation_id: &str) -> Result<ConversationSettings> {
        self.settings
            .get(conversation_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ContextError::ConversationNotFound(conversation_id.to_string()))
    }

    fn save_settings(&self, conversation_id: &str, settings: ConversationSettings) -> Result<()> {
        match self.settings.get_mut(conversation_id) {
            Some(mut entry) => {
                *entry = settings;
                Ok(())
            }
            None => Err(ContextError::ConversationNotFound(conversation_id.to_string())),
        }
    }
}
