//! Message search capability used for recall
//!
//! The relevance finder only depends on [`MessageSearch`]. Production code
//! plugs in a full-text index; [`InMemoryMessageSearch`] is a keyword scan
//! over registered conversations.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::models::{Conversation, MessageRecord};
use super::text::words;

/// Search request scoped to one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub conversation_id: String,
    pub query: String,
    pub limit: usize,
}

/// One page of search results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    pub messages: Vec<MessageRecord>,
    /// Total matches before the limit was applied
    pub total: usize,
}

/// Search errors
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Search timed out after {0} ms")]
    Timeout(u64),

    #[error("Search backend error: {0}")]
    Backend(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
}

#[async_trait]
pub trait MessageSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SearchError>;
}

/// Keyword search over conversations held in memory
#[derive(Debug, Default)]
pub struct InMemoryMessageSearch {
    conversations: DashMap<String, Vec<MessageRecord>>,
}

impl InMemoryMessageSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the searchable messages of a conversation
    pub fn index_conversation(&self, conversation: &Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation.messages.clone());
    }

    pub fn remove_conversation(&self, conversation_id: &str) {
        self.conversations.remove(conversation_id);
    }
}

#[async_trait]
impl MessageSearch for InMemoryMessageSearch {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SearchError> {
        let messages = self
            .conversations
            .get(&query.conversation_id)
            .ok_or_else(|| SearchError::UnknownConversation(query.conversation_id.clone()))?;

        let terms: Vec<String> = words(&query.query).collect();
        if terms.is_empty() {
            return Ok(SearchPage::default());
        }

        let matches: Vec<MessageRecord> = messages
            .iter()
            .rev()
            .filter(|m| {
                let content: Vec<String> = words(&m.content).collect();
                terms.iter().any(|t| content.contains(t))
            })
            .cloned()
            .collect();

        let total = matches.len();
        debug!(
            "In-memory search '{}' in {}: {} matches",
            query.query, query.conversation_id, total
        );

        Ok(SearchPage {
            messages: matches.into_iter().take(query.limit).collect(),
            total,
        })
    }
}
