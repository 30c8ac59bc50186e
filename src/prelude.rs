//! Common imports

pub use crate::config::{Config, LoggingConfig};
pub use crate::context::{
    ConfigurationResolver, ContextCache, ContextConfig, ContextMessage, ContextOptions,
    ContextResult, ContextStrategy, ContextWindowManager, Conversation, ConversationSettings,
    ConversationStore, InMemoryConversationStore, InMemoryMessageSearch, MessageOrigin,
    MessageRecord, MessageRole, MessageSearch, ModelCapacity, OptimizeOptions,
    PreservationScorer, RelevanceFinder, RelevantContext, TokenBudget,
};
pub use crate::error::{ContextError, FieldError, Result};
pub use crate::metrics::METRICS;
