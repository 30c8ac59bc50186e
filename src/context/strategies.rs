//! Retention strategies
//!
//! Each selectable [`ContextStrategy`] is backed by one [`RetentionStrategy`].
//! Strategies only choose non-system messages; system messages are always
//! retained by the window manager, and strategies fill whatever budget they
//! leave behind.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use tracing::debug;

use super::models::{ContextMessage, ContextStrategy, MessageRecord, MessageRole};
use super::scorer::{MarkerMap, PreservationScorer};
use super::summarizer::Summarizer;
use super::token_estimator::TokenEstimator;

/// Inputs shared by every strategy for one build
pub struct StrategyContext<'a> {
    /// Budget left once system messages are accounted for
    pub remaining: usize,
    pub recent_message_count: usize,
    pub scorer: &'a PreservationScorer,
    pub summarizer: &'a dyn Summarizer,
    pub estimator: &'a dyn TokenEstimator,
    pub now: DateTime<Utc>,
}

/// Messages kept or dropped together. Indices point into the message slice.
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedUnit {
    pub indices: Vec<usize>,
    pub tokens: usize,
    pub priority: f64,
}

impl RetainedUnit {
    fn single(index: usize, message: &MessageRecord) -> Self {
        Self {
            indices: vec![index],
            tokens: message.token_count,
            priority: 0.0,
        }
    }

    fn pair(first: usize, messages: &[MessageRecord]) -> Self {
        Self {
            indices: vec![first, first + 1],
            tokens: messages[first].token_count + messages[first + 1].token_count,
            priority: 0.0,
        }
    }

    pub fn is_pair(&self) -> bool {
        self.indices.len() == 2
    }

    /// Position of the newest member, used for recency ordering
    pub fn newest(&self) -> usize {
        self.indices.iter().copied().max().unwrap_or(0)
    }
}

/// Non-system messages chosen by a strategy
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub units: Vec<RetainedUnit>,
    pub summary: Option<ContextMessage>,
    pub pairs_preserved: Option<usize>,
    pub avg_importance_score: Option<f64>,
}

impl Selection {
    pub fn tokens(&self) -> usize {
        self.units.iter().map(|u| u.tokens).sum::<usize>()
            + self.summary.as_ref().map(|s| s.token_count).unwrap_or(0)
    }
}

pub trait RetentionStrategy: Send + Sync {
    fn strategy(&self) -> ContextStrategy;

    fn select(&self, messages: &[MessageRecord], ctx: &StrategyContext<'_>) -> Selection;
}

/// Strategy implementation for a configured strategy.
///
/// `FullContext` has none; `SearchEnhancedTruncation` runs intelligent
/// truncation as its base phase and is augmented by the window manager.
pub fn retention_strategy(strategy: ContextStrategy) -> Option<&'static dyn RetentionStrategy> {
    match strategy {
        ContextStrategy::FullContext => None,
        ContextStrategy::RecentMessages => Some(&RecentMessages),
        ContextStrategy::ImportantMessages => Some(&ImportantMessages),
        ContextStrategy::SummarizedContext => Some(&SummarizedContext),
        ContextStrategy::IntelligentTruncation => Some(&IntelligentTruncation),
        ContextStrategy::AdvancedIntelligentTruncation => Some(&AdvancedIntelligentTruncation),
        ContextStrategy::SearchEnhancedTruncation => Some(&IntelligentTruncation),
    }
}

fn non_system(messages: &[MessageRecord]) -> impl Iterator<Item = usize> + '_ {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.is_system())
        .map(|(i, _)| i)
}

/// Group non-system messages into units: a user message directly followed
/// by an assistant message forms a pair, everything else stands alone.
pub fn conversation_units(messages: &[MessageRecord]) -> Vec<RetainedUnit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let message = &messages[i];
        if message.is_system() {
            i += 1;
            continue;
        }
        let pairs_with_next = message.role == MessageRole::User
            && messages
                .get(i + 1)
                .map(|next| next.role == MessageRole::Assistant)
                .unwrap_or(false);
        if pairs_with_next {
            units.push(RetainedUnit::pair(i, messages));
            i += 2;
        } else {
            units.push(RetainedUnit::single(i, message));
            i += 1;
        }
    }
    units
}

fn mean_priority(indices: &[usize], messages: &[MessageRecord], markers: &MarkerMap) -> f64 {
    if indices.is_empty() {
        return 0.0;
    }
    let total: f64 = indices
        .iter()
        .filter_map(|i| markers.get(&messages[*i].sequence_number))
        .map(|info| info.priority_score)
        .sum();
    total / indices.len() as f64
}

/// Higher priority first, ties newer first
fn by_priority_then_recency(a: &RetainedUnit, b: &RetainedUnit) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| b.newest().cmp(&a.newest()))
}

/// System messages plus the contiguous tail that fits
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentMessages;

impl RetentionStrategy for RecentMessages {
    fn strategy(&self) -> ContextStrategy {
        ContextStrategy::RecentMessages
    }

    fn select(&self, messages: &[MessageRecord], ctx: &StrategyContext<'_>) -> Selection {
        let mut used = 0;
        let mut units = Vec::new();
        let candidates: Vec<usize> = non_system(messages).collect();

        for &i in candidates.iter().rev() {
            let tokens = messages[i].token_count;
            if used + tokens > ctx.remaining {
                break;
            }
            used += tokens;
            units.push(RetainedUnit::single(i, &messages[i]));
        }

        debug!(
            "recent_messages kept {} of {} messages ({} tokens)",
            units.len(),
            candidates.len(),
            used
        );
        Selection {
            units,
            ..Selection::default()
        }
    }
}

/// System messages plus non-system messages by descending priority
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportantMessages;

impl RetentionStrategy for ImportantMessages {
    fn strategy(&self) -> ContextStrategy {
        ContextStrategy::ImportantMessages
    }

    fn select(&self, messages: &[MessageRecord], ctx: &StrategyContext<'_>) -> Selection {
        let markers = ctx.scorer.score(messages, ctx.now);
        let mut ranked: Vec<RetainedUnit> = non_system(messages)
            .map(|i| RetainedUnit {
                priority: mean_priority(&[i], messages, &markers),
                ..RetainedUnit::single(i, &messages[i])
            })
            .collect();
        ranked.sort_by(by_priority_then_recency);

        let mut used = 0;
        let mut units = Vec::new();
        for unit in ranked {
            if used + unit.tokens <= ctx.remaining {
                used += unit.tokens;
                units.push(unit);
            }
        }

        debug!("important_messages kept {} messages ({} tokens)", units.len(), used);
        Selection {
            units,
            ..Selection::default()
        }
    }
}

/// System messages, a recent tail and one summary of the evicted middle
#[derive(Debug, Clone, Copy, Default)]
pub struct SummarizedContext;

impl SummarizedContext {
    fn tail(candidates: &[usize], messages: &[MessageRecord], len: usize) -> Vec<RetainedUnit> {
        candidates[candidates.len() - len..]
            .iter()
            .map(|&i| RetainedUnit::single(i, &messages[i]))
            .collect()
    }
}

impl RetentionStrategy for SummarizedContext {
    fn strategy(&self) -> ContextStrategy {
        ContextStrategy::SummarizedContext
    }

    fn select(&self, messages: &[MessageRecord], ctx: &StrategyContext<'_>) -> Selection {
        let candidates: Vec<usize> = non_system(messages).collect();
        let max_tail = ctx.recent_message_count.min(candidates.len());
        let tail_tokens = |len: usize| -> usize {
            candidates[candidates.len() - len..]
                .iter()
                .map(|&i| messages[i].token_count)
                .sum()
        };

        for len in (0..=max_tail).rev() {
            let tokens = tail_tokens(len);
            if tokens > ctx.remaining {
                continue;
            }

            let evicted: Vec<&MessageRecord> = candidates[..candidates.len() - len]
                .iter()
                .map(|&i| &messages[i])
                .collect();
            if evicted.is_empty() {
                return Selection {
                    units: Self::tail(&candidates, messages, len),
                    ..Selection::default()
                };
            }

            let text = ctx.summarizer.summarize(&evicted);
            let summary_tokens = ctx.estimator.estimate(&text);
            if tokens + summary_tokens <= ctx.remaining {
                debug!(
                    "summarized_context kept {} recent messages, summarized {} ({} tokens)",
                    len,
                    evicted.len(),
                    summary_tokens
                );
                return Selection {
                    units: Self::tail(&candidates, messages, len),
                    summary: Some(ContextMessage::summary(text, summary_tokens)),
                    ..Selection::default()
                };
            }
        }

        // The summary never fits; keep the longest recent tail on its own
        let len = (0..=max_tail)
            .rev()
            .find(|&len| tail_tokens(len) <= ctx.remaining)
            .unwrap_or(0);
        debug!("summarized_context could not fit a summary, keeping {} recent messages", len);
        Selection {
            units: Self::tail(&candidates, messages, len),
            ..Selection::default()
        }
    }
}

/// System messages plus whole user/assistant pairs, newest first, until one does not fit
#[derive(Debug, Clone, Copy, Default)]
pub struct IntelligentTruncation;

impl RetentionStrategy for IntelligentTruncation {
    fn strategy(&self) -> ContextStrategy {
        ContextStrategy::IntelligentTruncation
    }

    fn select(&self, messages: &[MessageRecord], ctx: &StrategyContext<'_>) -> Selection {
        let mut used = 0;
        let mut units = Vec::new();

        for unit in conversation_units(messages).into_iter().rev() {
            if used + unit.tokens > ctx.remaining {
                break;
            }
            used += unit.tokens;
            units.push(unit);
        }

        let pairs = units.iter().filter(|u| u.is_pair()).count();
        debug!(
            "intelligent_truncation kept {} units ({} pairs, {} tokens)",
            units.len(),
            pairs,
            used
        );
        Selection {
            units,
            pairs_preserved: Some(pairs),
            ..Selection::default()
        }
    }
}

/// Like [`IntelligentTruncation`] but units are ranked by preservation priority
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvancedIntelligentTruncation;

impl RetentionStrategy for AdvancedIntelligentTruncation {
    fn strategy(&self) -> ContextStrategy {
        ContextStrategy::AdvancedIntelligentTruncation
    }

    fn select(&self, messages: &[MessageRecord], ctx: &StrategyContext<'_>) -> Selection {
        let markers = ctx.scorer.score(messages, ctx.now);
        let mut ranked: Vec<RetainedUnit> = conversation_units(messages)
            .into_iter()
            .map(|unit| RetainedUnit {
                priority: mean_priority(&unit.indices, messages, &markers),
                ..unit
            })
            .collect();

        // The latest exchange leads, the rest compete on priority
        let latest = ranked.pop();
        ranked.sort_by(by_priority_then_recency);
        if let Some(latest) = latest {
            ranked.insert(0, latest);
        }

        let mut used = 0;
        let mut units = Vec::new();
        for unit in ranked {
            if used + unit.tokens <= ctx.remaining {
                used += unit.tokens;
                units.push(unit);
            }
        }

        let kept_scores: Vec<f64> = units
            .iter()
            .flat_map(|u| u.indices.iter())
            .filter_map(|i| markers.get(&messages[*i].sequence_number))
            .map(|info| info.priority_score)
            .collect();
        let avg_importance_score = if kept_scores.is_empty() {
            0.0
        } else {
            kept_scores.iter().sum::<f64>() / kept_scores.len() as f64
        };
        let pairs = units.iter().filter(|u| u.is_pair()).count();

        debug!(
            "advanced_intelligent_truncation kept {} units ({} pairs, avg importance {:.2})",
            units.len(),
            pairs,
            avg_importance_score
        );
        Selection {
            units,
            pairs_preserved: Some(pairs),
            avg_importance_score: Some(avg_importance_score),
            ..Selection::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::TopicSummarizer;
    use crate::context::token_estimator::WordBasedEstimator;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn msg(seq: u64, role: MessageRole, content: &str, tokens: usize) -> MessageRecord {
        MessageRecord::new(role, content, seq, tokens, now() - chrono::Duration::hours(2))
    }

    /// System message followed by alternating user/assistant turns
    fn dialogue(turns: usize, tokens: usize) -> Vec<MessageRecord> {
        let mut messages = vec![msg(0, MessageRole::System, "You are helpful.", 10)];
        for i in 0..turns {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            messages.push(msg(i as u64 + 1, role, &format!("turn number {}", i), tokens));
        }
        messages
    }

    fn run(strategy: &dyn RetentionStrategy, messages: &[MessageRecord], remaining: usize) -> Selection {
        run_with(strategy, messages, remaining, 10)
    }

    fn run_with(
        strategy: &dyn RetentionStrategy,
        messages: &[MessageRecord],
        remaining: usize,
        recent_message_count: usize,
    ) -> Selection {
        let scorer = PreservationScorer::default();
        let summarizer = TopicSummarizer::default();
        let estimator = WordBasedEstimator::default();
        let ctx = StrategyContext {
            remaining,
            recent_message_count,
            scorer: &scorer,
            summarizer: &summarizer,
            estimator: &estimator,
            now: now(),
        };
        strategy.select(messages, &ctx)
    }

    fn kept(selection: &Selection) -> Vec<usize> {
        let mut indices: Vec<usize> = selection
            .units
            .iter()
            .flat_map(|u| u.indices.iter().copied())
            .collect();
        indices.sort_unstable();
        indices
    }

    #[test]
    fn test_dispatch_covers_selectable_strategies() {
        for strategy in ContextStrategy::SELECTABLE {
            assert!(retention_strategy(strategy).is_some());
        }
        assert!(retention_strategy(ContextStrategy::FullContext).is_none());
        assert_eq!(
            retention_strategy(ContextStrategy::SearchEnhancedTruncation).map(|s| s.strategy()),
            Some(ContextStrategy::IntelligentTruncation)
        );
    }

    #[test]
    fn test_conversation_units_pair_user_with_assistant() {
        let messages = vec![
            msg(1, MessageRole::System, "sys", 5),
            msg(2, MessageRole::User, "q1", 5),
            msg(3, MessageRole::Assistant, "a1", 5),
            msg(4, MessageRole::Assistant, "extra", 5),
            msg(5, MessageRole::User, "q2", 5),
        ];
        let units = conversation_units(&messages);
        let shapes: Vec<Vec<usize>> = units.iter().map(|u| u.indices.clone()).collect();
        assert_eq!(shapes, vec![vec![1, 2], vec![3], vec![4]]);
    }

    #[test]
    fn test_recent_messages_keeps_contiguous_tail() {
        let messages = dialogue(10, 20);
        let selection = run(&RecentMessages, &messages, 70);
        assert_eq!(kept(&selection), vec![8, 9, 10]);
        assert_eq!(selection.tokens(), 60);
    }

    #[test]
    fn test_recent_messages_stops_at_first_gap() {
        let mut messages = dialogue(4, 10);
        messages[3].token_count = 100;
        let selection = run(&RecentMessages, &messages, 50);
        assert_eq!(kept(&selection), vec![4]);
    }

    #[test]
    fn test_important_messages_prefers_high_priority() {
        let messages = vec![
            msg(1, MessageRole::User, "This is important: my deploy key rotates weekly", 20),
            msg(2, MessageRole::Assistant, "ok", 20),
            msg(3, MessageRole::User, "cool", 20),
            msg(4, MessageRole::Assistant, "sure", 20),
        ];
        let selection = run(&ImportantMessages, &messages, 40);
        let indices = kept(&selection);
        assert!(indices.contains(&0));
        assert_eq!(indices.len(), 2);
    }

    #[test]
    fn test_important_messages_skips_what_does_not_fit() {
        let messages = vec![
            msg(1, MessageRole::User, "Remember this critical detail", 50),
            msg(2, MessageRole::Assistant, "noted", 10),
            msg(3, MessageRole::User, "thanks", 10),
        ];
        let selection = run(&ImportantMessages, &messages, 25);
        assert_eq!(kept(&selection), vec![1, 2]);
    }

    #[test]
    fn test_summarized_context_adds_summary_before_tail() {
        let messages = dialogue(10, 20);
        let selection = run_with(&SummarizedContext, &messages, 70, 2);
        let summary = selection.summary.as_ref().expect("summary created");
        assert_eq!(summary.role, MessageRole::System);
        assert!(summary.sequence_number.is_none());
        assert_eq!(kept(&selection), vec![9, 10]);
        assert!(selection.tokens() <= 70);
    }

    #[test]
    fn test_summarized_context_shrinks_tail_to_fit_summary() {
        let messages = dialogue(10, 20);
        let selection = run_with(&SummarizedContext, &messages, 60, 10);
        assert!(selection.summary.is_some());
        assert!(selection.tokens() <= 60);
        assert!(kept(&selection).len() < 3);
    }

    #[test]
    fn test_summarized_context_without_room_for_summary() {
        let messages = dialogue(4, 20);
        let selection = run_with(&SummarizedContext, &messages, 5, 10);
        assert!(selection.summary.is_none());
        assert!(selection.units.is_empty());
    }

    #[test]
    fn test_intelligent_truncation_keeps_whole_pairs() {
        let messages = dialogue(10, 20);
        let selection = run(&IntelligentTruncation, &messages, 70);
        assert_eq!(kept(&selection), vec![9, 10]);
        assert_eq!(selection.pairs_preserved, Some(1));
        for unit in &selection.units {
            assert!(unit.is_pair());
        }
    }

    #[test]
    fn test_intelligent_truncation_stops_at_first_misfit() {
        let mut messages = dialogue(6, 10);
        messages[3].token_count = 200;
        let selection = run(&IntelligentTruncation, &messages, 100);
        assert_eq!(kept(&selection), vec![5, 6]);
    }

    #[test]
    fn test_advanced_truncation_ranks_pairs_by_priority() {
        let messages = vec![
            msg(1, MessageRole::User, "How do I fix this error in `main.rs`?", 20),
            msg(2, MessageRole::Assistant, "The solution is to add a lifetime.", 20),
            msg(3, MessageRole::User, "nice weather", 20),
            msg(4, MessageRole::Assistant, "indeed", 20),
            msg(5, MessageRole::User, "ok", 20),
            msg(6, MessageRole::Assistant, "ok", 20),
        ];
        let selection = run(&AdvancedIntelligentTruncation, &messages, 80);
        assert_eq!(kept(&selection), vec![0, 1, 4, 5]);
        assert_eq!(selection.pairs_preserved, Some(2));
        assert!(selection.avg_importance_score.unwrap_or(0.0) > 0.0);
    }

    #[test]
    fn test_nothing_fits_in_zero_budget() {
        let messages = dialogue(4, 10);
        for strategy in ContextStrategy::SELECTABLE {
            let Some(imp) = retention_strategy(strategy) else {
                continue;
            };
            let selection = run(imp, &messages, 0);
            assert_eq!(selection.tokens(), 0, "{} kept tokens", strategy);
        }
    }
}
