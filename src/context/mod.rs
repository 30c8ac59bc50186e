//! Conversation context management
//!
//! Decides which prior messages stay inside a model's token window on every
//! turn: resolves settings, scores messages for preservation, runs a retention
//! strategy under a hard token budget and recalls relevant older messages.

pub mod cache;
pub mod clock;
pub mod models;
pub mod relevance;
pub mod resolver;
pub mod scorer;
pub mod search;
pub mod store;
pub mod strategies;
pub mod summarizer;
pub mod text;
pub mod token_budget;
pub mod token_estimator;
pub mod window_manager;

pub use cache::ContextCache;
pub use clock::{Clock, FixedClock, SystemClock};
pub use models::{
    ContextMessage, ContextResult, ContextStrategy, Conversation, ConversationSettings,
    MessageOrigin, MessageRecord, MessageRole, ModelCapacity,
};
pub use relevance::{
    extract_search_terms, has_referential_language, RelevanceConfig, RelevanceFinder,
    RelevantContext, SearchOptions, SearchStatistics,
};
pub use resolver::{
    ConfigurationResolver, ContextConfig, ContextDefaults, ConversationPurpose, ProviderDefaults,
    ProviderDefaultsTable,
};
pub use scorer::{
    MarkerMap, MarkerWeights, PreservationInfo, PreservationMarker, PreservationScorer,
    ScorerConfig,
};
pub use search::{InMemoryMessageSearch, MessageSearch, SearchError, SearchPage, SearchQuery};
pub use store::{ConversationStore, InMemoryConversationStore};
pub use strategies::RetentionStrategy;
pub use summarizer::{ConcatenationSummarizer, Summarizer, TopicSummarizer};
pub use token_budget::{BudgetError, TokenBudget};
pub use token_estimator::{TiktokenEstimator, TokenEstimator, WordBasedEstimator};
pub use window_manager::{ContextOptions, ContextWindowManager, OptimizeOptions, OptimizedContext};
