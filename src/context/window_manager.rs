//! Context window manager
//!
//! Orchestrates one context build:
//! 1. resolve settings and the token budget
//! 2. return everything when it already fits (`full_context`)
//! 3. run the configured retention strategy over non-system messages
//! 4. optionally augment with recalled messages from the relevance finder
//! 5. enforce the budget and assemble the result in conversation order
//!
//! Recall augmentation is a separate phase over the base result; strategies
//! never call back into the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::cache::ContextCache;
use super::clock::{Clock, SystemClock};
use super::models::{
    ContextMessage, ContextResult, ContextStrategy, Conversation, MessageOrigin, MessageRecord,
    ModelCapacity,
};
use super::relevance::{has_referential_language, RelevanceFinder, SearchOptions, SearchStatistics};
use super::resolver::{ConfigurationResolver, ContextConfig};
use super::scorer::PreservationScorer;
use super::strategies::{retention_strategy, Selection, StrategyContext};
use super::summarizer::{Summarizer, TopicSummarizer};
use super::token_budget::TokenBudget;
use super::token_estimator::{default_estimator, TokenEstimator};
use crate::error::Result;
use crate::metrics::METRICS;

/// Header of the injected context block
pub const INJECTION_HEADER: &str = "Relevant conversation context:";

const FILLER_WORDS: &[&str] = &[
    "actually",
    "basically",
    "essentially",
    "literally",
    "really",
    "simply",
    "totally",
    "very",
];

/// Per-call overrides on top of the resolved configuration
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub strategy: Option<ContextStrategy>,
    pub ratio: Option<f64>,
    pub search_enhanced: Option<bool>,
    /// Bypass the result cache for this call
    pub skip_cache: bool,
}

/// Options for [`ContextWindowManager::optimize_context`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizeOptions {
    #[serde(default)]
    pub strip_filler_words: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedContext {
    pub result: ContextResult,
    pub tokens_saved: usize,
}

/// Working state of one build between selection and assembly
struct Plan<'a> {
    messages: &'a [MessageRecord],
    config: ContextConfig,
    budget: TokenBudget,
    strategy: ContextStrategy,
    system: Vec<usize>,
    selection: Selection,
    /// Indices of recalled messages, most relevant first
    recalled: Vec<usize>,
    search_statistics: Option<SearchStatistics>,
    augment: bool,
    now: DateTime<Utc>,
    cache_key: Option<String>,
    started: Instant,
}

impl Plan<'_> {
    fn tokens(&self) -> usize {
        let system: usize = self.system.iter().map(|&i| self.messages[i].token_count).sum();
        let recalled: usize = self.recalled.iter().map(|&i| self.messages[i].token_count).sum();
        system + self.selection.tokens() + recalled
    }

    fn kept_indices(&self) -> HashSet<usize> {
        self.system
            .iter()
            .copied()
            .chain(self.selection.units.iter().flat_map(|u| u.indices.iter().copied()))
            .chain(self.recalled.iter().copied())
            .collect()
    }

    /// Shed until the budget holds. Returns (messages shed, system-only).
    fn enforce(&mut self) -> (usize, bool) {
        let mut shed = 0;
        while !self.budget.fits(self.tokens()) {
            if self.recalled.pop().is_some() {
                shed += 1;
                continue;
            }

            let weakest = self
                .selection
                .units
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.priority
                        .total_cmp(&b.priority)
                        .then_with(|| a.newest().cmp(&b.newest()))
                })
                .map(|(pos, _)| pos);
            if let Some(pos) = weakest {
                let unit = self.selection.units.remove(pos);
                shed += unit.indices.len();
                continue;
            }

            if self.selection.summary.take().is_some() {
                continue;
            }

            // System messages alone exceed the budget
            let messages = self.messages;
            let budget = self.budget;
            let mut used = 0;
            self.system.retain(|&i| {
                let tokens = messages[i].token_count;
                if tokens <= budget.remaining(used) {
                    used += tokens;
                    true
                } else {
                    shed += 1;
                    false
                }
            });
            return (shed, true);
        }
        (shed, false)
    }
}

enum Prepared<'a> {
    Done(ContextResult),
    Plan(Plan<'a>),
}

fn position(messages: &[MessageRecord], sequence_number: u64) -> Option<usize> {
    messages
        .binary_search_by_key(&sequence_number, |m| m.sequence_number)
        .ok()
}

/// Produces the message list sent to a provider for one turn
pub struct ContextWindowManager {
    resolver: ConfigurationResolver,
    scorer: PreservationScorer,
    finder: Option<RelevanceFinder>,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
    cache: Option<ContextCache>,
}

impl Default for ContextWindowManager {
    fn default() -> Self {
        Self::new(ConfigurationResolver::default())
    }
}

impl ContextWindowManager {
    pub fn new(resolver: ConfigurationResolver) -> Self {
        Self {
            resolver,
            scorer: PreservationScorer::default(),
            finder: None,
            summarizer: Arc::new(TopicSummarizer::default()),
            estimator: default_estimator(),
            clock: Arc::new(SystemClock),
            cache: None,
        }
    }

    pub fn with_scorer(mut self, scorer: PreservationScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_relevance_finder(mut self, finder: RelevanceFinder) -> Self {
        self.finder = Some(finder);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Clock used for preservation scoring. The relevance finder keeps its own.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cache(mut self, cache: ContextCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn resolver(&self) -> &ConfigurationResolver {
        &self.resolver
    }

    pub fn scorer(&self) -> &PreservationScorer {
        &self.scorer
    }

    /// Context for handing a conversation to another model. Never searches.
    pub fn preserve_context_for_switch(
        &self,
        conversation: &Conversation,
        capacity: &ModelCapacity,
        options: &ContextOptions,
    ) -> Result<ContextResult> {
        match self.prepare(conversation, capacity, None, options)? {
            Prepared::Done(result) => Ok(result),
            Prepared::Plan(mut plan) => {
                if plan.strategy == ContextStrategy::SearchEnhancedTruncation {
                    plan.strategy = ContextStrategy::IntelligentTruncation;
                }
                plan.augment = false;
                Ok(self.finish(plan))
            }
        }
    }

    /// Context for the next turn of `conversation` on its own model
    pub async fn build_intelligent_context(
        &self,
        conversation: &Conversation,
        current_message: &str,
        options: &ContextOptions,
    ) -> Result<ContextResult> {
        let mut plan =
            match self.prepare(conversation, &conversation.model, Some(current_message), options)? {
                Prepared::Done(result) => return Ok(result),
                Prepared::Plan(plan) => plan,
            };

        if plan.augment {
            match &self.finder {
                Some(finder) => {
                    let search_options = SearchOptions {
                        max_results: Some(plan.config.max_search_results),
                        relevance_threshold: Some(plan.config.relevance_threshold),
                    };
                    let relevant = finder
                        .find_relevant_context(conversation, current_message, &search_options)
                        .await;

                    let kept = plan.kept_indices();
                    let mut used = plan.tokens();
                    for candidate in &relevant.relevant_messages {
                        let Some(index) = position(plan.messages, candidate.sequence_number) else {
                            continue;
                        };
                        let record = &plan.messages[index];
                        if record.is_system() || kept.contains(&index) || plan.recalled.contains(&index)
                        {
                            continue;
                        }
                        if record.token_count <= plan.budget.remaining(used) {
                            used += record.token_count;
                            plan.recalled.push(index);
                        }
                    }

                    debug!(
                        "Recalled {} of {} relevant messages for {}",
                        plan.recalled.len(),
                        relevant.relevant_messages.len(),
                        conversation.id
                    );
                    plan.search_statistics = Some(RelevanceFinder::get_search_statistics(&relevant));
                }
                None => debug!("Search enhancement requested but no relevance finder is attached"),
            }
        }

        Ok(self.finish(plan))
    }

    /// Whether middleware should build recall context for this message
    pub fn should_inject_context(&self, message: &str) -> bool {
        has_referential_language(message)
    }

    /// Search-enhanced build for request-time injection
    pub async fn build_context_for_middleware(
        &self,
        conversation: &Conversation,
        message: &str,
    ) -> Result<ContextResult> {
        let options = ContextOptions {
            search_enhanced: Some(true),
            ..ContextOptions::default()
        };
        self.build_intelligent_context(conversation, message, &options)
            .await
    }

    /// Render a result as a labeled text block. Empty results render as "".
    pub fn format_context_for_injection(result: &ContextResult) -> String {
        if result.is_empty() {
            return String::new();
        }

        let mut lines = vec![INJECTION_HEADER.to_string()];
        for message in &result.messages {
            let line = match message.origin {
                MessageOrigin::History => format!("{}: {}", message.role, message.content),
                MessageOrigin::Recalled => {
                    format!("[recalled] {}: {}", message.role, message.content)
                }
                MessageOrigin::Summary => format!("[summary] {}", message.content),
            };
            lines.push(line);
        }
        lines.join("\n")
    }

    /// True iff the result fits `window_size` and is not an inconsistent empty result
    pub fn validate_context_preservation(result: &ContextResult, window_size: usize) -> bool {
        result.total_tokens <= window_size && (!result.messages.is_empty() || result.total_tokens == 0)
    }

    /// Shrink message content without changing order or membership
    pub fn optimize_context(result: &ContextResult, options: &OptimizeOptions) -> OptimizedContext {
        let mut optimized = result.clone();
        for message in &mut optimized.messages {
            let content = optimize_text(&message.content, options.strip_filler_words);
            let before = message.content.chars().count();
            let after = content.chars().count();
            if after < before && before > 0 {
                let scaled = (message.token_count * after).div_ceil(before);
                message.token_count = scaled.min(message.token_count);
                message.content = content;
            }
        }
        optimized.total_tokens = optimized.messages.iter().map(|m| m.token_count).sum();

        let tokens_saved = result.total_tokens.saturating_sub(optimized.total_tokens);
        debug!("Context optimization saved {} tokens", tokens_saved);
        OptimizedContext {
            result: optimized,
            tokens_saved,
        }
    }

    fn prepare<'a>(
        &self,
        conversation: &'a Conversation,
        capacity: &ModelCapacity,
        current_message: Option<&str>,
        options: &ContextOptions,
    ) -> Result<Prepared<'a>> {
        conversation.validate()?;
        let started = Instant::now();

        let mut config = self.resolver.resolve(conversation, capacity);
        if let Some(strategy) = options.strategy {
            config.strategy = strategy;
        }
        if let Some(ratio) = options.ratio {
            config.ratio = ratio;
        }
        if let Some(search_enhanced) = options.search_enhanced {
            config.search_enhanced = search_enhanced;
        }
        let budget = config.budget()?;
        let now = self.clock.now();

        let cache_key = match (&self.cache, options.skip_cache) {
            (Some(cache), false) => {
                let key = ContextCache::fingerprint(conversation, &config, current_message, now);
                if let Some(hit) = cache.get(&key) {
                    debug!("Context cache hit for {}", conversation.id);
                    return Ok(Prepared::Done((*hit).clone()));
                }
                Some(key)
            }
            _ => None,
        };

        let messages = conversation.messages.as_slice();
        let total = conversation.total_tokens();
        if budget.fits(total) {
            debug!(
                "All {} messages ({} tokens) fit budget {} of window {} for {}",
                messages.len(),
                total,
                budget.limit(),
                budget.window_size(),
                conversation.id
            );
            let result = ContextResult::full_context(messages);
            METRICS.record_context_build(
                ContextStrategy::FullContext.as_str(),
                result.total_tokens,
                result.original_count,
                result.preserved_count,
            );
            if let Some(key) = cache_key {
                self.store(key, &result, &config);
            }
            return Ok(Prepared::Done(result));
        }

        let implementation = match retention_strategy(config.strategy) {
            Some(implementation) => implementation,
            None => {
                warn!(
                    "Strategy {} cannot truncate, using {}",
                    config.strategy,
                    ContextStrategy::default()
                );
                config.strategy = ContextStrategy::default();
                retention_strategy(config.strategy).unwrap_or(&super::strategies::IntelligentTruncation)
            }
        };

        let system: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_system())
            .map(|(i, _)| i)
            .collect();
        let system_tokens: usize = system.iter().map(|&i| messages[i].token_count).sum();

        let ctx = StrategyContext {
            remaining: budget.remaining(system_tokens),
            recent_message_count: config.recent_message_count,
            scorer: &self.scorer,
            summarizer: self.summarizer.as_ref(),
            estimator: self.estimator.as_ref(),
            now,
        };
        let selection = implementation.select(messages, &ctx);

        let augment = config.search_enhanced
            || config.strategy == ContextStrategy::SearchEnhancedTruncation;
        Ok(Prepared::Plan(Plan {
            messages,
            strategy: config.strategy,
            config,
            budget,
            system,
            selection,
            recalled: Vec::new(),
            search_statistics: None,
            augment,
            now,
            cache_key,
            started,
        }))
    }

    fn finish(&self, mut plan: Plan<'_>) -> ContextResult {
        let units_before = plan.selection.units.len();
        let excess = plan.budget.calculate_shrinkage(plan.tokens());
        if excess > 0 {
            debug!("Selection is {} tokens over budget {}, shedding", excess, plan.budget.limit());
        }
        let (shed, system_only) = plan.enforce();
        if shed > 0 || system_only {
            METRICS.context_budget_enforcements.inc();
        }
        if system_only {
            METRICS.context_system_only.inc();
            warn!(
                "System messages alone exceed budget {}, returning {} system messages",
                plan.budget.limit(),
                plan.system.len()
            );
        }

        let first_tail = plan
            .selection
            .units
            .iter()
            .flat_map(|u| u.indices.iter())
            .map(|&i| plan.messages[i].sequence_number)
            .min()
            .unwrap_or(u64::MAX);

        let mut entries: Vec<(u64, u8, ContextMessage)> = Vec::new();
        for &i in &plan.system {
            let record = &plan.messages[i];
            entries.push((
                record.sequence_number,
                1,
                ContextMessage::from_record(record, MessageOrigin::History),
            ));
        }
        for unit in &plan.selection.units {
            for &i in &unit.indices {
                let record = &plan.messages[i];
                entries.push((
                    record.sequence_number,
                    1,
                    ContextMessage::from_record(record, MessageOrigin::History),
                ));
            }
        }
        for &i in &plan.recalled {
            let record = &plan.messages[i];
            entries.push((
                record.sequence_number,
                1,
                ContextMessage::from_record(record, MessageOrigin::Recalled),
            ));
        }
        let summary_created = plan.selection.summary.is_some();
        if let Some(summary) = plan.selection.summary.take() {
            entries.push((first_tail, 0, summary));
        }
        entries.sort_by_key(|(seq, rank, _)| (*seq, *rank));

        let messages: Vec<ContextMessage> = entries.into_iter().map(|(_, _, m)| m).collect();
        let total_tokens: usize = messages.iter().map(|m| m.token_count).sum();
        let preserved_count = messages
            .iter()
            .filter(|m| m.origin != MessageOrigin::Summary)
            .count();
        let original_count = plan.messages.len();

        let pairs_preserved = plan
            .selection
            .pairs_preserved
            .map(|_| plan.selection.units.iter().filter(|u| u.is_pair()).count());
        let avg_importance_score = match plan.selection.avg_importance_score {
            Some(avg) if plan.selection.units.len() == units_before => Some(avg),
            Some(_) => Some(self.average_importance(&plan)),
            None => None,
        };
        let recalled_count = plan.search_statistics.as_ref().map(|_| plan.recalled.len());

        let result = ContextResult {
            messages,
            total_tokens,
            truncated: preserved_count < original_count,
            strategy: plan.strategy,
            original_count,
            preserved_count,
            summary_created,
            pairs_preserved,
            avg_importance_score,
            recalled_count,
            search_statistics: plan.search_statistics.take(),
        };

        let label = plan.strategy.as_str();
        METRICS.record_context_build(label, total_tokens, original_count, preserved_count);
        METRICS
            .context_build_duration
            .with_label_values(&[label])
            .observe(plan.started.elapsed().as_secs_f64());
        if summary_created {
            METRICS.summaries_created.inc();
        }
        if !plan.recalled.is_empty() {
            METRICS.messages_recalled.inc_by(plan.recalled.len() as f64);
        }

        info!(
            "Built context with {}: kept {}/{} messages, {} tokens (budget {}){}",
            label,
            preserved_count,
            original_count,
            total_tokens,
            plan.budget.limit(),
            if plan.recalled.is_empty() {
                String::new()
            } else {
                format!(", {} recalled", plan.recalled.len())
            }
        );

        if let Some(key) = plan.cache_key.take() {
            self.store(key, &result, &plan.config);
        }
        result
    }

    fn average_importance(&self, plan: &Plan<'_>) -> f64 {
        let markers = self.scorer.score(plan.messages, plan.now);
        let scores: Vec<f64> = plan
            .selection
            .units
            .iter()
            .flat_map(|u| u.indices.iter())
            .filter_map(|&i| markers.get(&plan.messages[i].sequence_number))
            .map(|info| info.priority_score)
            .collect();
        if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }

    fn store(&self, key: String, result: &ContextResult, config: &ContextConfig) {
        if let Some(cache) = &self.cache {
            cache.insert(key, result.clone(), config.cache_ttl());
        }
    }
}

/// Collapse whitespace and repeated words outside fenced code blocks
fn optimize_text(content: &str, strip_filler: bool) -> String {
    content
        .split("```")
        .enumerate()
        .map(|(i, segment)| {
            if i % 2 == 1 {
                segment.to_string()
            } else {
                optimize_prose(segment, strip_filler)
            }
        })
        .collect::<Vec<_>>()
        .join("```")
}

fn optimize_prose(segment: &str, strip_filler: bool) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in segment.lines() {
        let mut words: Vec<&str> = Vec::new();
        for word in line.split_whitespace() {
            if strip_filler && FILLER_WORDS.contains(&word.to_lowercase().as_str()) {
                continue;
            }
            if words
                .last()
                .map(|prev| prev.eq_ignore_ascii_case(word))
                .unwrap_or(false)
            {
                continue;
            }
            words.push(word);
        }
        let line = words.join(" ");
        if line.is_empty() && lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            continue;
        }
        lines.push(line);
    }

    let mut out = lines.join("\n");
    // Keep the line breaks that separate prose from an adjacent fence
    if segment.ends_with('\n') && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if segment.starts_with('\n') && !out.starts_with('\n') {
        out.insert(0, '\n');
    }
    out
}
