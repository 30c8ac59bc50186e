//! Data models for conversation context management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::relevance::SearchStatistics;
use crate::error::{ContextError, Result};

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Function,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Function => "function",
            MessageRole::Tool => "tool",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, MessageRole::System)
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a conversation's ordered log. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: MessageRole,
    pub content: String,
    pub sequence_number: u64,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        role: MessageRole,
        content: impl Into<String>,
        sequence_number: u64,
        token_count: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            sequence_number,
            token_count,
            created_at,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role.is_system()
    }
}

/// Retention strategy names.
///
/// `FullContext` is never configured; the manager selects it whenever the
/// whole history already fits the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    FullContext,
    RecentMessages,
    ImportantMessages,
    SummarizedContext,
    IntelligentTruncation,
    AdvancedIntelligentTruncation,
    SearchEnhancedTruncation,
}

impl ContextStrategy {
    /// Strategies that may be configured on a conversation or provider
    pub const SELECTABLE: [ContextStrategy; 6] = [
        ContextStrategy::RecentMessages,
        ContextStrategy::ImportantMessages,
        ContextStrategy::SummarizedContext,
        ContextStrategy::IntelligentTruncation,
        ContextStrategy::AdvancedIntelligentTruncation,
        ContextStrategy::SearchEnhancedTruncation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStrategy::FullContext => "full_context",
            ContextStrategy::RecentMessages => "recent_messages",
            ContextStrategy::ImportantMessages => "important_messages",
            ContextStrategy::SummarizedContext => "summarized_context",
            ContextStrategy::IntelligentTruncation => "intelligent_truncation",
            ContextStrategy::AdvancedIntelligentTruncation => "advanced_intelligent_truncation",
            ContextStrategy::SearchEnhancedTruncation => "search_enhanced_truncation",
        }
    }

    pub fn is_selectable(&self) -> bool {
        !matches!(self, ContextStrategy::FullContext)
    }
}

impl Default for ContextStrategy {
    fn default() -> Self {
        ContextStrategy::IntelligentTruncation
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full_context" => Ok(ContextStrategy::FullContext),
            "recent_messages" => Ok(ContextStrategy::RecentMessages),
            "important_messages" => Ok(ContextStrategy::ImportantMessages),
            "summarized_context" => Ok(ContextStrategy::SummarizedContext),
            "intelligent_truncation" => Ok(ContextStrategy::IntelligentTruncation),
            "advanced_intelligent_truncation" => Ok(ContextStrategy::AdvancedIntelligentTruncation),
            "search_enhanced_truncation" => Ok(ContextStrategy::SearchEnhancedTruncation),
            other => Err(format!("unknown context strategy '{}'", other)),
        }
    }
}

/// Conversation-level overrides. `None` falls through to provider and global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ContextStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_enhanced: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_search_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_message_count: Option<usize>,
}

impl ConversationSettings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Capacity facts supplied by the provider layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapacity {
    pub context_length: usize,
    pub provider_id: String,
}

impl ModelCapacity {
    pub fn new(context_length: usize, provider_id: impl Into<String>) -> Self {
        Self {
            context_length,
            provider_id: provider_id.into(),
        }
    }
}

/// A conversation: ordered messages plus settings and target model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub model: ModelCapacity,
    #[serde(default)]
    pub settings: ConversationSettings,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

impl Conversation {
    /// Create an empty conversation with a generated id
    pub fn new(model: ModelCapacity) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), model)
    }

    pub fn with_id(id: impl Into<String>, model: ModelCapacity) -> Self {
        Self {
            id: id.into(),
            model,
            settings: ConversationSettings::default(),
            messages: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: ConversationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_messages(mut self, messages: Vec<MessageRecord>) -> Self {
        self.messages = messages;
        self
    }

    pub fn total_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.token_count).sum()
    }

    /// Find a message by its sequence number
    pub fn message(&self, sequence_number: u64) -> Option<&MessageRecord> {
        self.messages
            .binary_search_by_key(&sequence_number, |m| m.sequence_number)
            .ok()
            .map(|idx| &self.messages[idx])
    }

    /// Check that sequence numbers are strictly increasing
    pub fn validate(&self) -> Result<()> {
        for pair in self.messages.windows(2) {
            if pair[1].sequence_number <= pair[0].sequence_number {
                return Err(ContextError::InvalidConversation {
                    conversation_id: self.id.clone(),
                    reason: format!(
                        "sequence number {} follows {}; sequence numbers must be strictly increasing",
                        pair[1].sequence_number, pair[0].sequence_number
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Where a message in a context result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    History,
    Summary,
    Recalled,
}

/// Lightweight view of a message sent to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
    /// Absent only for the synthesized summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    pub token_count: usize,
    pub origin: MessageOrigin,
}

impl ContextMessage {
    pub fn from_record(record: &MessageRecord, origin: MessageOrigin) -> Self {
        Self {
            role: record.role,
            content: record.content.clone(),
            sequence_number: Some(record.sequence_number),
            token_count: record.token_count,
            origin,
        }
    }

    pub fn summary(content: String, token_count: usize) -> Self {
        Self {
            role: MessageRole::System,
            content,
            sequence_number: None,
            token_count,
            origin: MessageOrigin::Summary,
        }
    }

    pub fn is_recalled(&self) -> bool {
        self.origin == MessageOrigin::Recalled
    }
}

/// Output of the context window manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    pub messages: Vec<ContextMessage>,
    pub total_tokens: usize,
    pub truncated: bool,
    pub strategy: ContextStrategy,
    pub original_count: usize,
    pub preserved_count: usize,
    pub summary_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairs_preserved: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_importance_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recalled_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_statistics: Option<SearchStatistics>,
}

impl ContextResult {
    /// Every message, untruncated
    pub fn full_context(messages: &[MessageRecord]) -> Self {
        Self {
            messages: messages
                .iter()
                .map(|m| ContextMessage::from_record(m, MessageOrigin::History))
                .collect(),
            total_tokens: messages.iter().map(|m| m.token_count).sum(),
            truncated: false,
            strategy: ContextStrategy::FullContext,
            original_count: messages.len(),
            preserved_count: messages.len(),
            summary_created: false,
            pairs_preserved: None,
            avg_importance_score: None,
            recalled_count: None,
            search_statistics: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn recalled_messages(&self) -> impl Iterator<Item = &ContextMessage> {
        self.messages.iter().filter(|m| m.is_recalled())
    }
}
