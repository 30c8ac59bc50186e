//! Configuration resolver for context management
//!
//! Effective settings are merged per field, highest precedence first:
//! 1. conversation-level overrides
//! 2. provider defaults (explicit table keyed by provider id)
//! 3. global defaults (window size = model context length)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::models::{ContextStrategy, Conversation, ConversationSettings, ModelCapacity};
use super::store::ConversationStore;
use super::token_budget::{BudgetError, TokenBudget, DEFAULT_BUDGET_RATIO};
use crate::error::{ContextError, FieldError, Result};

/// Smallest window that still holds a system message plus one turn
pub const MIN_WINDOW_SIZE: usize = 100;

/// Effective context settings for one conversation/model pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub window_size: usize,
    pub strategy: ContextStrategy,
    pub ratio: f64,
    pub search_enhanced: bool,
    pub cache_ttl_secs: u64,
    pub max_search_results: usize,
    pub relevance_threshold: f64,
    /// Verbatim tail kept by `summarized_context`
    pub recent_message_count: usize,
}

impl ContextConfig {
    pub fn budget(&self) -> std::result::Result<TokenBudget, BudgetError> {
        TokenBudget::new(self.window_size, self.ratio)
    }

    /// Copy one named field from `source`
    fn fallback_field(&mut self, field: &str, source: &ContextConfig) {
        match field {
            "window_size" => self.window_size = source.window_size,
            "ratio" => self.ratio = source.ratio,
            "strategy" => self.strategy = source.strategy,
            "relevance_threshold" => self.relevance_threshold = source.relevance_threshold,
            "max_search_results" => self.max_search_results = source.max_search_results,
            "recent_message_count" => self.recent_message_count = source.recent_message_count,
            _ => {}
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_strategy() -> ContextStrategy {
    ContextStrategy::IntelligentTruncation
}

fn default_ratio() -> f64 {
    DEFAULT_BUDGET_RATIO
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_search_results() -> usize {
    10
}

fn default_relevance_threshold() -> f64 {
    0.3
}

fn default_recent_message_count() -> usize {
    10
}

/// Global defaults. The window size always comes from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDefaults {
    #[serde(default = "default_strategy")]
    pub strategy: ContextStrategy,

    #[serde(default = "default_ratio")]
    pub ratio: f64,

    #[serde(default)]
    pub search_enhanced: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,

    #[serde(default = "default_recent_message_count")]
    pub recent_message_count: usize,
}

impl Default for ContextDefaults {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            ratio: default_ratio(),
            search_enhanced: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            max_search_results: default_max_search_results(),
            relevance_threshold: default_relevance_threshold(),
            recent_message_count: default_recent_message_count(),
        }
    }
}

/// Provider-specific defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDefaults {
    #[serde(default)]
    pub ratio: Option<f64>,
    #[serde(default)]
    pub strategy: Option<ContextStrategy>,
    #[serde(default)]
    pub search_enhanced: Option<bool>,
    #[serde(default)]
    pub max_search_results: Option<usize>,
    #[serde(default)]
    pub relevance_threshold: Option<f64>,
    #[serde(default)]
    pub recent_message_count: Option<usize>,
}

/// Provider defaults keyed case-insensitively by provider id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderDefaultsTable {
    entries: HashMap<String, ProviderDefaults>,
}

impl ProviderDefaultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults shipped with the crate
    pub fn builtin() -> Self {
        let ratio = |ratio: f64| ProviderDefaults {
            ratio: Some(ratio),
            ..ProviderDefaults::default()
        };

        Self::new()
            .with("anthropic", ratio(0.85))
            .with("openai", ratio(0.8))
            .with(
                "google",
                ProviderDefaults {
                    ratio: Some(0.9),
                    strategy: Some(ContextStrategy::SummarizedContext),
                    ..ProviderDefaults::default()
                },
            )
            .with(
                "gemini",
                ProviderDefaults {
                    ratio: Some(0.9),
                    strategy: Some(ContextStrategy::SummarizedContext),
                    ..ProviderDefaults::default()
                },
            )
            .with("mistral", ratio(0.75))
            .with(
                "ollama",
                ProviderDefaults {
                    ratio: Some(0.7),
                    strategy: Some(ContextStrategy::RecentMessages),
                    ..ProviderDefaults::default()
                },
            )
    }

    pub fn with(mut self, provider_id: &str, defaults: ProviderDefaults) -> Self {
        self.insert(provider_id, defaults);
        self
    }

    pub fn insert(&mut self, provider_id: &str, defaults: ProviderDefaults) {
        self.entries.insert(provider_id.to_ascii_lowercase(), defaults);
    }

    pub fn get(&self, provider_id: &str) -> Option<&ProviderDefaults> {
        self.entries.get(&provider_id.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<HashMap<String, ProviderDefaults>> for ProviderDefaultsTable {
    fn from(map: HashMap<String, ProviderDefaults>) -> Self {
        let mut table = Self::new();
        for (provider_id, defaults) in map {
            table.insert(&provider_id, defaults);
        }
        table
    }
}

fn changed<T: PartialEq>(value: T, default: T) -> Option<T> {
    (value != default).then_some(value)
}

/// Conversation purpose tags with tuned presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPurpose {
    Chat,
    Analysis,
    Coding,
    Creative,
}

impl FromStr for ConversationPurpose {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(ConversationPurpose::Chat),
            "analysis" => Ok(ConversationPurpose::Analysis),
            "coding" => Ok(ConversationPurpose::Coding),
            "creative" => Ok(ConversationPurpose::Creative),
            other => Err(format!("unknown conversation purpose '{}'", other)),
        }
    }
}

/// Resolves, validates, applies and resets context settings
#[derive(Debug, Clone)]
pub struct ConfigurationResolver {
    defaults: ContextDefaults,
    providers: ProviderDefaultsTable,
}

impl Default for ConfigurationResolver {
    fn default() -> Self {
        Self::new(ContextDefaults::default(), ProviderDefaultsTable::builtin())
    }
}

impl ConfigurationResolver {
    pub fn new(defaults: ContextDefaults, providers: ProviderDefaultsTable) -> Self {
        Self {
            defaults,
            providers,
        }
    }

    pub fn defaults(&self) -> &ContextDefaults {
        &self.defaults
    }

    pub fn providers(&self) -> &ProviderDefaultsTable {
        &self.providers
    }

    /// Global defaults for a model, ignoring provider and conversation
    pub fn global_config(&self, capacity: &ModelCapacity) -> ContextConfig {
        ContextConfig {
            window_size: capacity.context_length,
            strategy: self.defaults.strategy,
            ratio: self.defaults.ratio,
            search_enhanced: self.defaults.search_enhanced,
            cache_ttl_secs: self.defaults.cache_ttl_secs,
            max_search_results: self.defaults.max_search_results,
            relevance_threshold: self.defaults.relevance_threshold,
            recent_message_count: self.defaults.recent_message_count,
        }
    }

    /// Defaults for a model with provider defaults applied
    pub fn provider_config(&self, capacity: &ModelCapacity) -> ContextConfig {
        let mut config = self.global_config(capacity);
        if let Some(provider) = self.providers.get(&capacity.provider_id) {
            if let Some(ratio) = provider.ratio {
                config.ratio = ratio;
            }
            if let Some(strategy) = provider.strategy {
                config.strategy = strategy;
            }
            if let Some(search_enhanced) = provider.search_enhanced {
                config.search_enhanced = search_enhanced;
            }
            if let Some(max) = provider.max_search_results {
                config.max_search_results = max;
            }
            if let Some(threshold) = provider.relevance_threshold {
                config.relevance_threshold = threshold;
            }
            if let Some(count) = provider.recent_message_count {
                config.recent_message_count = count;
            }
        }
        config
    }

    /// Effective settings for a conversation on a model
    pub fn resolve(&self, conversation: &Conversation, capacity: &ModelCapacity) -> ContextConfig {
        let base = self.provider_config(capacity);
        let settings = &conversation.settings;

        let mut config = ContextConfig {
            window_size: settings
                .window_size
                .map(|w| w.min(capacity.context_length))
                .unwrap_or(base.window_size),
            strategy: settings.strategy.unwrap_or(base.strategy),
            ratio: settings.ratio.unwrap_or(base.ratio),
            search_enhanced: settings.search_enhanced.unwrap_or(base.search_enhanced),
            cache_ttl_secs: settings.cache_ttl_secs.unwrap_or(base.cache_ttl_secs),
            max_search_results: settings.max_search_results.unwrap_or(base.max_search_results),
            relevance_threshold: settings
                .relevance_threshold
                .unwrap_or(base.relevance_threshold),
            recent_message_count: settings
                .recent_message_count
                .unwrap_or(base.recent_message_count),
        };

        // Invalid stored or provider values fall back one level at a time
        let global = self.global_config(capacity);
        for (level, fallback) in [("provider", &base), ("global", &global)] {
            let errors = Self::validate(&config);
            if errors.is_empty() {
                break;
            }
            for error in errors {
                warn!(
                    "Ignoring invalid {} for conversation {} ({}), using {} value",
                    error.field, conversation.id, error.message, level
                );
                config.fallback_field(&error.field, fallback);
            }
        }
        if config.budget().is_err() {
            warn!(
                "Ratio {} is unusable for conversation {}, using {}",
                config.ratio, conversation.id, DEFAULT_BUDGET_RATIO
            );
            config.ratio = DEFAULT_BUDGET_RATIO;
        }

        debug!(
            "Resolved context config for {} on {}: window={}, ratio={}, strategy={}",
            conversation.id, capacity.provider_id, config.window_size, config.ratio, config.strategy
        );
        config
    }

    /// Field-level validation. An empty list means the config is valid.
    pub fn validate(config: &ContextConfig) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if config.window_size < MIN_WINDOW_SIZE {
            errors.push(FieldError::new(
                "window_size",
                format!("must be at least {} tokens", MIN_WINDOW_SIZE),
            ));
        }
        if !config.ratio.is_finite() || config.ratio <= 0.0 || config.ratio > 1.0 {
            errors.push(FieldError::new("ratio", "must be in (0, 1]"));
        }
        if !config.strategy.is_selectable() {
            errors.push(FieldError::new(
                "strategy",
                format!("'{}' is selected automatically and cannot be configured", config.strategy),
            ));
        }
        if !config.relevance_threshold.is_finite()
            || !(0.0..=1.0).contains(&config.relevance_threshold)
        {
            errors.push(FieldError::new("relevance_threshold", "must be in [0, 1]"));
        }
        if config.max_search_results == 0 {
            errors.push(FieldError::new("max_search_results", "must be at least 1"));
        }
        if config.recent_message_count == 0 {
            errors.push(FieldError::new("recent_message_count", "must be at least 1"));
        }

        errors
    }

    /// Parse a strategy name as supplied by an admin surface
    pub fn parse_strategy(name: &str) -> std::result::Result<ContextStrategy, FieldError> {
        let strategy = name
            .parse::<ContextStrategy>()
            .map_err(|e| FieldError::new("strategy", e))?;
        if !strategy.is_selectable() {
            return Err(FieldError::new(
                "strategy",
                format!("'{}' is selected automatically and cannot be configured", strategy),
            ));
        }
        Ok(strategy)
    }

    /// Validate and persist `config` as the conversation's overrides.
    /// Only fields that differ from the computed defaults are stored.
    pub fn apply(
        &self,
        store: &dyn ConversationStore,
        conversation: &Conversation,
        config: &ContextConfig,
    ) -> Result<ConversationSettings> {
        let errors = Self::validate(config);
        if !errors.is_empty() {
            return Err(ContextError::InvalidConfig(errors));
        }

        let defaults = self.provider_config(&conversation.model);
        let settings = ConversationSettings {
            window_size: changed(config.window_size, defaults.window_size),
            ratio: changed(config.ratio, defaults.ratio),
            strategy: changed(config.strategy, defaults.strategy),
            search_enhanced: changed(config.search_enhanced, defaults.search_enhanced),
            cache_ttl_secs: changed(config.cache_ttl_secs, defaults.cache_ttl_secs),
            max_search_results: changed(config.max_search_results, defaults.max_search_results),
            relevance_threshold: changed(config.relevance_threshold, defaults.relevance_threshold),
            recent_message_count: changed(
                config.recent_message_count,
                defaults.recent_message_count,
            ),
        };

        store.save_settings(&conversation.id, settings.clone())?;
        info!("Applied context settings to conversation {}", conversation.id);
        Ok(settings)
    }

    /// Clear overrides and return the recomputed defaults
    pub fn reset(
        &self,
        store: &dyn ConversationStore,
        conversation: &Conversation,
    ) -> Result<ContextConfig> {
        store.save_settings(&conversation.id, ConversationSettings::default())?;
        info!("Reset context settings for conversation {}", conversation.id);
        Ok(self.provider_config(&conversation.model))
    }

    /// Pre-tuned settings for a conversation purpose; unknown purposes get the global defaults
    pub fn recommend(&self, purpose: &str, capacity: &ModelCapacity) -> ContextConfig {
        let mut config = self.global_config(capacity);
        match purpose.parse::<ConversationPurpose>() {
            Ok(ConversationPurpose::Chat) => {
                config.strategy = ContextStrategy::RecentMessages;
                config.search_enhanced = true;
            }
            Ok(ConversationPurpose::Analysis) => {
                config.strategy = ContextStrategy::ImportantMessages;
                config.ratio = 0.9;
                config.search_enhanced = false;
            }
            Ok(ConversationPurpose::Coding) => {
                config.strategy = ContextStrategy::IntelligentTruncation;
                config.search_enhanced = true;
            }
            Ok(ConversationPurpose::Creative) => {
                config.strategy = ContextStrategy::SummarizedContext;
                config.search_enhanced = false;
            }
            Err(e) => debug!("{}, using global defaults", e),
        }
        config
    }
}
