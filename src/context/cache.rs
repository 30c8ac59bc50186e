//! Cache of context results with per-entry TTL

use moka::sync::Cache;
use moka::Expiry;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::debug;

use super::models::{ContextResult, Conversation};
use super::resolver::ContextConfig;
use crate::metrics::METRICS;

const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Width of the scoring-time bucket in cache keys. Recency markers and
/// relevance decay are computed against the build time, so a cached result
/// is reused only within the same minute.
pub const SCORING_BUCKET_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedResult {
    result: Arc<ContextResult>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedResult> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResult,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Context results keyed by a fingerprint of everything that shaped them
#[derive(Clone)]
pub struct ContextCache {
    entries: Cache<String, CachedResult>,
}

impl ContextCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    /// Compute the cache key for one build
    pub fn fingerprint(
        conversation: &Conversation,
        config: &ContextConfig,
        current_message: Option<&str>,
        scored_at: DateTime<Utc>,
    ) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(conversation.id.as_bytes());
        hasher.update(b"|");
        for message in &conversation.messages {
            hasher.update(message.sequence_number.to_le_bytes());
            hasher.update((message.token_count as u64).to_le_bytes());
        }
        hasher.update(b"|");
        // Serializing a plain struct of numbers and enums cannot fail
        if let Ok(config_json) = serde_json::to_vec(config) {
            hasher.update(&config_json);
        }
        hasher.update(b"|");
        if let Some(message) = current_message {
            hasher.update(message.as_bytes());
        }
        hasher.update(b"|");
        hasher.update(
            scored_at
                .timestamp()
                .div_euclid(SCORING_BUCKET_SECS)
                .to_le_bytes(),
        );

        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Arc<ContextResult>> {
        let hit = self.entries.get(key).map(|entry| entry.result);
        METRICS.record_cache_lookup(hit.is_some());
        hit
    }

    /// Store a result; a zero TTL disables caching for it
    pub fn insert(&self, key: String, result: ContextResult, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        debug!("Caching context result {} for {:?}", key, ttl);
        self.entries.insert(
            key,
            CachedResult {
                result: Arc::new(result),
                ttl,
            },
        );
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}
