//! Crate configuration
//!
//! Loaded from an optional TOML file and `CONTEXT__SECTION__KEY` environment
//! variables (environment wins). A `.env` file is read first when present.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::context::relevance::RelevanceConfig;
use crate::context::resolver::{
    ConfigurationResolver, ContextConfig, ContextDefaults, ProviderDefaults, ProviderDefaultsTable,
    MIN_WINDOW_SIZE,
};
use crate::context::scorer::{PreservationScorer, ScorerConfig};
use crate::error::{ContextError, FieldError, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CONTEXT";

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: ContextDefaults,

    /// Provider defaults layered over the built-in table
    #[serde(default)]
    pub providers: HashMap<String, ProviderDefaults>,

    #[serde(default)]
    pub scorer: ScorerConfig,

    #[serde(default)]
    pub search: RelevanceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load from a TOML file and the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ContextError::InvalidConfig(errors));
        }
        Ok(config)
    }

    /// Check defaults, provider entries and scorer weights
    pub fn validate(&self) -> Vec<FieldError> {
        let defaults = ContextConfig {
            window_size: MIN_WINDOW_SIZE,
            strategy: self.defaults.strategy,
            ratio: self.defaults.ratio,
            search_enhanced: self.defaults.search_enhanced,
            cache_ttl_secs: self.defaults.cache_ttl_secs,
            max_search_results: self.defaults.max_search_results,
            relevance_threshold: self.defaults.relevance_threshold,
            recent_message_count: self.defaults.recent_message_count,
        };
        let mut errors: Vec<FieldError> = ConfigurationResolver::validate(&defaults)
            .into_iter()
            .map(|e| FieldError::new(format!("defaults.{}", e.field), e.message))
            .collect();

        let mut provider_ids: Vec<&String> = self.providers.keys().collect();
        provider_ids.sort();
        for id in provider_ids {
            let provider = &self.providers[id];
            let merged = ContextConfig {
                ratio: provider.ratio.unwrap_or(defaults.ratio),
                strategy: provider.strategy.unwrap_or(defaults.strategy),
                max_search_results: provider.max_search_results.unwrap_or(defaults.max_search_results),
                relevance_threshold: provider
                    .relevance_threshold
                    .unwrap_or(defaults.relevance_threshold),
                recent_message_count: provider
                    .recent_message_count
                    .unwrap_or(defaults.recent_message_count),
                ..defaults.clone()
            };
            errors.extend(
                ConfigurationResolver::validate(&merged)
                    .into_iter()
                    .map(|e| FieldError::new(format!("providers.{}.{}", id, e.field), e.message)),
            );
        }

        errors.extend(
            self.scorer
                .weights
                .validate()
                .into_iter()
                .map(|e| FieldError::new(format!("scorer.{}", e.field), e.message)),
        );

        errors
    }

    /// Built-in provider table with configured entries layered on top
    pub fn provider_table(&self) -> ProviderDefaultsTable {
        let mut table = ProviderDefaultsTable::builtin();
        for (id, defaults) in &self.providers {
            table.insert(id, defaults.clone());
        }
        table
    }

    pub fn resolver(&self) -> ConfigurationResolver {
        ConfigurationResolver::new(self.defaults.clone(), self.provider_table())
    }

    pub fn scorer(&self) -> PreservationScorer {
        PreservationScorer::new(self.scorer.clone())
    }
}
