//! Relevance finder: recall of older messages referenced by the current turn
//!
//! Flow:
//! 1. Extract search terms from referential phrasings in the current message
//!    ("what was my X", "we discussed X", "tell me more about X", ...)
//! 2. Query the [`MessageSearch`] capability under a bounded timeout
//! 3. Score candidates by keyword overlap and recency, drop weak matches
//!
//! Search failures never propagate. A failed or timed-out search yields an
//! empty result with `search_performed = true`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::models::{Conversation, MessageRecord};
use super::search::{MessageSearch, SearchError, SearchPage, SearchQuery};
use super::text::{content_words, words};
use crate::metrics::METRICS;

/// Maximum words taken from one captured phrase
const MAX_PHRASE_WORDS: usize = 6;

static REFERENTIAL_TEMPLATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bwhat\s+(?:was|were|is|are)\s+my\s+([\w\s'-]+)",
        r"(?i)\bremember\s+when\s+(?:we|i|you)\s+(?:talked|spoke|chatted)\s+about\s+([\w\s'-]+)",
        r"(?i)\bdo\s+you\s+remember\s+(?:when\s+|what\s+|that\s+)?([\w\s'-]+)",
        r"(?i)\bwe\s+(?:discussed|talked\s+about|spoke\s+about|covered)\s+([\w\s'-]+)",
        r"(?i)\byou\s+(?:said|mentioned|told\s+me|suggested|recommended)\s+(?:about\s+|that\s+)?([\w\s'-]+)",
        r"(?i)\btell\s+me\s+more\s+about\s+([\w\s'-]+)",
        r"(?i)\bwhat\s+did\s+(?:i|we|you)\s+(?:say|tell\s+you|mention|decide)\s+about\s+([\w\s'-]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("referential pattern is valid"))
    .collect()
});

fn default_max_search_results() -> usize {
    10
}

fn default_relevance_threshold() -> f64 {
    0.3
}

fn default_search_timeout_ms() -> u64 {
    2000
}

fn default_recency_half_life_hours() -> f64 {
    24.0
}

fn default_keyword_weight() -> f64 {
    0.7
}

/// Relevance finder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceConfig {
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,

    /// Upper bound on one search call
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,

    /// Age at which the recency bonus halves
    #[serde(default = "default_recency_half_life_hours")]
    pub recency_half_life_hours: f64,

    /// Share of the score from keyword overlap; the rest is recency
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            max_search_results: default_max_search_results(),
            relevance_threshold: default_relevance_threshold(),
            search_timeout_ms: default_search_timeout_ms(),
            recency_half_life_hours: default_recency_half_life_hours(),
            keyword_weight: default_keyword_weight(),
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub relevance_threshold: Option<f64>,
}

/// Ranked recall candidates for the current turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevantContext {
    pub search_performed: bool,
    pub search_terms: Vec<String>,
    pub total_found: usize,
    /// Sorted by descending relevance, ties newer first
    pub relevant_messages: Vec<MessageRecord>,
    /// Sequence number to score, same order as `relevant_messages`
    pub relevance_scores: IndexMap<u64, f64>,
}

impl RelevantContext {
    fn skipped() -> Self {
        Self::default()
    }

    fn degraded(search_terms: Vec<String>) -> Self {
        Self {
            search_performed: true,
            search_terms,
            ..Self::default()
        }
    }
}

/// Aggregate view of a relevance result for observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatistics {
    pub search_performed: bool,
    pub search_terms_count: usize,
    pub relevant_messages_found: usize,
    pub avg_relevance_score: f64,
    pub max_relevance_score: f64,
    pub min_relevance_score: f64,
    pub search_terms: Vec<String>,
}

/// Extract topical search terms from referential phrasings
pub fn extract_search_terms(message: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();

    for template in REFERENTIAL_TEMPLATES.iter() {
        for captures in template.captures_iter(message) {
            let Some(phrase) = captures.get(1) else {
                continue;
            };
            for word in content_words(phrase.as_str()).take(MAX_PHRASE_WORDS) {
                if seen.insert(word.clone()) {
                    terms.push(word);
                }
            }
        }
    }

    terms
}

/// Whether the message refers back to earlier conversation
pub fn has_referential_language(message: &str) -> bool {
    !extract_search_terms(message).is_empty()
}

/// Finds older messages relevant to the current turn
pub struct RelevanceFinder {
    search: Arc<dyn MessageSearch>,
    config: RelevanceConfig,
    clock: Arc<dyn Clock>,
}

impl RelevanceFinder {
    pub fn new(search: Arc<dyn MessageSearch>, config: RelevanceConfig) -> Self {
        Self {
            search,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RelevanceConfig {
        &self.config
    }

    /// Find recall candidates for `current_message` within `conversation`
    pub async fn find_relevant_context(
        &self,
        conversation: &Conversation,
        current_message: &str,
        options: &SearchOptions,
    ) -> RelevantContext {
        let search_terms = extract_search_terms(current_message);
        if search_terms.is_empty() {
            debug!("No referential language in current message, skipping search");
            METRICS.search_requests.with_label_values(&["skipped"]).inc();
            return RelevantContext::skipped();
        }

        let query = SearchQuery {
            conversation_id: conversation.id.clone(),
            query: search_terms.join(" "),
            limit: options.max_results.unwrap_or(self.config.max_search_results),
        };
        let threshold = options
            .relevance_threshold
            .unwrap_or(self.config.relevance_threshold);

        let page = match self.run_search(&query).await {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    "Search for conversation {} failed, continuing without recall: {}",
                    conversation.id, e
                );
                let outcome = match e {
                    SearchError::Timeout(_) => "timeout",
                    _ => "failed",
                };
                METRICS.search_requests.with_label_values(&[outcome]).inc();
                return RelevantContext::degraded(search_terms);
            }
        };
        METRICS.search_requests.with_label_values(&["performed"]).inc();

        let now = self.clock.now();
        // The current turn may already be logged as the newest message
        let current = current_message.trim();
        let current_seq = conversation
            .messages
            .last()
            .filter(|m| m.content.trim() == current)
            .map(|m| m.sequence_number);
        let mut seen = HashSet::new();
        let mut scored: Vec<(MessageRecord, f64)> = page
            .messages
            .into_iter()
            .filter(|m| Some(m.sequence_number) != current_seq)
            .filter(|m| seen.insert(m.sequence_number))
            .filter_map(|m| {
                let score = self.relevance_score(&search_terms, &m, now)?;
                (score >= threshold).then_some((m, score))
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.sequence_number.cmp(&a.sequence_number))
        });

        info!(
            "Relevance search for {:?}: {} candidates, {} above threshold {}",
            search_terms,
            page.total,
            scored.len(),
            threshold
        );

        let relevance_scores = scored.iter().map(|(m, s)| (m.sequence_number, *s)).collect();
        RelevantContext {
            search_performed: true,
            search_terms,
            total_found: page.total,
            relevant_messages: scored.into_iter().map(|(m, _)| m).collect(),
            relevance_scores,
        }
    }

    async fn run_search(&self, query: &SearchQuery) -> Result<SearchPage, SearchError> {
        let timeout = Duration::from_millis(self.config.search_timeout_ms);
        match tokio::time::timeout(timeout, self.search.search(query)).await {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout(self.config.search_timeout_ms)),
        }
    }

    /// Keyword overlap blended with a recency bonus. `None` when no term matches.
    pub fn relevance_score(
        &self,
        terms: &[String],
        message: &MessageRecord,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if terms.is_empty() {
            return None;
        }

        let content: HashSet<String> = words(&message.content).collect();
        let matched = terms.iter().filter(|t| content.contains(*t)).count();
        if matched == 0 {
            return None;
        }
        let keyword = matched as f64 / terms.len() as f64;

        let age_hours = (now - message.created_at).num_seconds().max(0) as f64 / 3600.0;
        let recency = 0.5f64.powf(age_hours / self.config.recency_half_life_hours.max(f64::EPSILON));

        let keyword_weight = self.config.keyword_weight.clamp(0.0, 1.0);
        Some(keyword_weight * keyword + (1.0 - keyword_weight) * recency)
    }

    /// Aggregate a result for observability
    pub fn get_search_statistics(result: &RelevantContext) -> SearchStatistics {
        let scores: Vec<f64> = result.relevance_scores.values().copied().collect();
        let (avg, max, min) = if scores.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                scores.iter().sum::<f64>() / scores.len() as f64,
                scores.iter().copied().fold(f64::MIN, f64::max),
                scores.iter().copied().fold(f64::MAX, f64::min),
            )
        };

        SearchStatistics {
            search_performed: result.search_performed,
            search_terms_count: result.search_terms.len(),
            relevant_messages_found: result.relevant_messages.len(),
            avg_relevance_score: avg,
            max_relevance_score: max,
            min_relevance_score: min,
            search_terms: result.search_terms.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::clock::FixedClock;
    use crate::context::models::{MessageRole, ModelCapacity};
    use crate::context::search::InMemoryMessageSearch;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn conversation() -> Conversation {
        let at = |hours: i64| now() - ChronoDuration::hours(hours);
        Conversation::with_id("conv", ModelCapacity::new(4000, "openai")).with_messages(vec![
            MessageRecord::new(MessageRole::User, "My favorite color is green", 1, 6, at(48)),
            MessageRecord::new(MessageRole::Assistant, "Green is a lovely color", 2, 6, at(48)),
            MessageRecord::new(MessageRole::User, "I walked my dog today", 3, 6, at(2)),
            MessageRecord::new(MessageRole::Assistant, "Your favorite color and dog are noted", 4, 8, at(1)),
        ])
    }

    fn finder(search: Arc<dyn MessageSearch>) -> RelevanceFinder {
        RelevanceFinder::new(search, RelevanceConfig::default())
            .with_clock(Arc::new(FixedClock(now())))
    }

    struct FailingSearch;

    #[async_trait]
    impl MessageSearch for FailingSearch {
        async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, SearchError> {
            Err(SearchError::Backend("index offline".to_string()))
        }
    }

    struct SlowSearch;

    #[async_trait]
    impl MessageSearch for SlowSearch {
        async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, SearchError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SearchPage::default())
        }
    }

    #[test]
    fn test_extracts_terms_from_referential_phrasings() {
        assert_eq!(
            extract_search_terms("What was my favorite color?"),
            vec!["favorite", "color"]
        );
        assert_eq!(
            extract_search_terms("Remember when we talked about the Paris trip?"),
            vec!["paris", "trip"]
        );
        assert_eq!(
            extract_search_terms("Tell me more about async runtimes"),
            vec!["async", "runtimes"]
        );
        assert_eq!(
            extract_search_terms("Earlier you mentioned a database migration."),
            vec!["database", "migration"]
        );
    }

    #[test]
    fn test_no_terms_without_referential_language() {
        assert!(extract_search_terms("Hello there!").is_empty());
        assert!(extract_search_terms("What is the capital of France?").is_empty());
        assert!(!has_referential_language("Hello there!"));
        assert!(has_referential_language("we discussed pricing tiers"));
    }

    #[test]
    fn test_stop_word_only_capture_yields_nothing() {
        assert!(extract_search_terms("What was my that?").is_empty());
    }

    #[tokio::test]
    async fn test_search_not_performed_for_plain_message() {
        let search = Arc::new(InMemoryMessageSearch::new());
        let conversation = conversation();
        search.index_conversation(&conversation);

        let result = finder(search)
            .find_relevant_context(&conversation, "Hello there!", &SearchOptions::default())
            .await;

        assert!(!result.search_performed);
        assert!(result.search_terms.is_empty());
        assert!(result.relevant_messages.is_empty());
    }

    #[tokio::test]
    async fn test_ranks_by_overlap_then_recency() {
        let search = Arc::new(InMemoryMessageSearch::new());
        let conversation = conversation();
        search.index_conversation(&conversation);

        let result = finder(search)
            .find_relevant_context(
                &conversation,
                "What was my favorite color?",
                &SearchOptions::default(),
            )
            .await;

        assert!(result.search_performed);
        assert_eq!(result.search_terms, vec!["favorite", "color"]);
        assert_eq!(result.total_found, 3);

        let order: Vec<u64> = result.relevant_messages.iter().map(|m| m.sequence_number).collect();
        // 4 and 1 match both terms; 4 is newer
        assert_eq!(order, vec![4, 1, 2]);

        let scores: Vec<f64> = result.relevance_scores.values().copied().collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn test_repeated_question_is_recalled_but_current_turn_is_not() {
        let mut messages = conversation().messages;
        messages.push(MessageRecord::new(
            MessageRole::User,
            "What was my favorite color?",
            5,
            6,
            now() - ChronoDuration::hours(30),
        ));
        messages.push(MessageRecord::new(MessageRole::Assistant, "Green", 6, 1, now()));
        messages.push(MessageRecord::new(
            MessageRole::User,
            "What was my favorite color?",
            7,
            6,
            now(),
        ));
        let conversation = conversation().with_messages(messages);
        let search = Arc::new(InMemoryMessageSearch::new());
        search.index_conversation(&conversation);

        let result = finder(search)
            .find_relevant_context(
                &conversation,
                "What was my favorite color?",
                &SearchOptions::default(),
            )
            .await;

        let seqs: Vec<u64> = result.relevant_messages.iter().map(|m| m.sequence_number).collect();
        assert!(seqs.contains(&5));
        assert!(!seqs.contains(&7));
    }

    #[tokio::test]
    async fn test_threshold_drops_weak_matches() {
        let search = Arc::new(InMemoryMessageSearch::new());
        let conversation = conversation();
        search.index_conversation(&conversation);

        let options = SearchOptions {
            relevance_threshold: Some(0.7),
            ..SearchOptions::default()
        };
        let result = finder(search)
            .find_relevant_context(&conversation, "What was my favorite color?", &options)
            .await;

        assert!(result.relevant_messages.iter().all(|m| m.sequence_number != 2));
        assert!(result.relevance_scores.values().all(|s| *s >= 0.7));
    }

    #[tokio::test]
    async fn test_search_failure_degrades_to_empty() {
        let result = finder(Arc::new(FailingSearch))
            .find_relevant_context(&conversation(), "What was my favorite color?", &SearchOptions::default())
            .await;

        assert!(result.search_performed);
        assert_eq!(result.total_found, 0);
        assert!(result.relevant_messages.is_empty());
        assert_eq!(result.search_terms, vec!["favorite", "color"]);
    }

    #[tokio::test]
    async fn test_search_timeout_degrades_to_empty() {
        let config = RelevanceConfig {
            search_timeout_ms: 20,
            ..RelevanceConfig::default()
        };
        let result = RelevanceFinder::new(Arc::new(SlowSearch), config)
            .with_clock(Arc::new(FixedClock(now())))
            .find_relevant_context(&conversation(), "Tell me more about dogs", &SearchOptions::default())
            .await;

        assert!(result.search_performed);
        assert_eq!(result.total_found, 0);
    }

    #[test]
    fn test_search_statistics() {
        let mut scores = IndexMap::new();
        scores.insert(4, 0.9);
        scores.insert(1, 0.5);
        let result = RelevantContext {
            search_performed: true,
            search_terms: vec!["favorite".to_string(), "color".to_string()],
            total_found: 3,
            relevant_messages: Vec::new(),
            relevance_scores: scores,
        };

        let stats = RelevanceFinder::get_search_statistics(&result);
        assert_eq!(stats.search_terms_count, 2);
        assert!((stats.avg_relevance_score - 0.7).abs() < 1e-9);
        assert_eq!(stats.max_relevance_score, 0.9);
        assert_eq!(stats.min_relevance_score, 0.5);

        let empty = RelevanceFinder::get_search_statistics(&RelevantContext::default());
        assert!(!empty.search_performed);
        assert_eq!(empty.avg_relevance_score, 0.0);
    }
}
