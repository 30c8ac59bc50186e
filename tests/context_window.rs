//! Integration tests for context window management
//!
//! These exercise the public API end to end: settings resolution, every
//! retention strategy under the token budget, and settings persistence.

use chrono::{DateTime, Duration, TimeZone, Utc};
use conversation_context::prelude::*;
use conversation_context::context::{
    FixedClock, OptimizeOptions, ProviderDefaultsTable, WordBasedEstimator,
};
use std::sync::Arc;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

fn manager() -> ContextWindowManager {
    ContextWindowManager::default()
        .with_clock(Arc::new(FixedClock(now())))
        .with_estimator(Arc::new(WordBasedEstimator::default()))
}

const SAMPLE_CONTENT: &[&str] = &[
    "How do I configure the connection pool?",
    "You can set max_connections in `pool.toml`.",
    "Important: the staging database password rotates weekly.",
    "I prefer short answers please.",
    "The build fails with a linker error.",
    "Try this fix: install the missing system library.",
    "Also what about the test suite?",
    "```rust\nfn main() {}\n```",
    "Thanks, that worked.",
    "As we discussed, deploys happen on Fridays.",
];

/// Deterministic pseudo-random conversation with interleaved system messages
fn generated(seed: u64, len: usize, context_length: usize) -> Conversation {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        state >> 33
    };

    let mut messages = Vec::with_capacity(len);
    for i in 0..len {
        let roll = next();
        let role = if i == 0 || roll % 17 == 0 {
            MessageRole::System
        } else if i % 2 == 1 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        let content = SAMPLE_CONTENT[(roll % SAMPLE_CONTENT.len() as u64) as usize];
        let tokens = 1 + (next() % 60) as usize;
        let age = Duration::minutes((len - i) as i64 * 7);
        messages.push(MessageRecord::new(role, content, i as u64 + 1, tokens, now() - age));
    }

    Conversation::with_id(
        format!("generated-{}", seed),
        ModelCapacity::new(context_length, "unknown"),
    )
    .with_messages(messages)
}

fn dialogue(turns: u64, tokens: usize, context_length: usize) -> Conversation {
    let mut messages = vec![MessageRecord::new(
        MessageRole::System,
        "You are a helpful assistant.",
        0,
        10,
        now(),
    )];
    for i in 1..=turns {
        let role = if i % 2 == 1 {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        messages.push(MessageRecord::new(role, format!("turn {}", i), i, tokens, now()));
    }
    Conversation::with_id("dialogue", ModelCapacity::new(context_length, "unknown"))
        .with_messages(messages)
}

fn with_strategy(strategy: ContextStrategy) -> ContextOptions {
    ContextOptions {
        strategy: Some(strategy),
        ..ContextOptions::default()
    }
}

#[test]
fn test_capacity_invariant_for_every_strategy() {
    let manager = manager();
    for seed in 0..40 {
        let conversation = generated(seed, 5 + (seed as usize % 30), 100 + seed as usize * 25);
        for strategy in ContextStrategy::SELECTABLE {
            let result = manager
                .preserve_context_for_switch(
                    &conversation,
                    &conversation.model,
                    &with_strategy(strategy),
                )
                .unwrap();
            let budget = TokenBudget::new(conversation.model.context_length, 0.8)
                .unwrap()
                .limit();

            assert!(
                result.total_tokens <= budget,
                "{} on seed {} used {} of {}",
                strategy,
                seed,
                result.total_tokens,
                budget
            );
            assert_eq!(
                result.total_tokens,
                result.messages.iter().map(|m| m.token_count).sum::<usize>()
            );
            assert!(result.preserved_count <= result.original_count);
            assert_eq!(result.truncated, result.preserved_count < result.original_count);
            assert!(ContextWindowManager::validate_context_preservation(
                &result,
                conversation.model.context_length
            ));
        }
    }
}

#[test]
fn test_system_messages_survive_every_strategy() {
    let manager = manager();
    for seed in 0..20 {
        let conversation = generated(seed, 30, 400);
        let system_tokens: usize = conversation
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.token_count)
            .sum();
        if system_tokens > 320 {
            continue;
        }
        let system_seqs: Vec<u64> = conversation
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.sequence_number)
            .collect();

        for strategy in ContextStrategy::SELECTABLE {
            let result = manager
                .preserve_context_for_switch(
                    &conversation,
                    &conversation.model,
                    &with_strategy(strategy),
                )
                .unwrap();
            for seq in &system_seqs {
                assert!(
                    result.messages.iter().any(|m| m.sequence_number == Some(*seq)),
                    "{} dropped system message {} on seed {}",
                    strategy,
                    seq,
                    seed
                );
            }
        }
    }
}

#[test]
fn test_recent_messages_scenario() {
    let conversation = dialogue(10, 20, 100);
    let result = manager()
        .preserve_context_for_switch(
            &conversation,
            &conversation.model,
            &with_strategy(ContextStrategy::RecentMessages),
        )
        .unwrap();

    assert!(result.truncated);
    assert_eq!(result.total_tokens, 70);
    assert_eq!(result.messages[0].role, MessageRole::System);
    let tail: Vec<Option<u64>> = result.messages[1..]
        .iter()
        .map(|m| m.sequence_number)
        .collect();
    assert_eq!(tail, vec![Some(8), Some(9), Some(10)]);
}

#[test]
fn test_empty_conversation() {
    let conversation = Conversation::new(ModelCapacity::new(4000, "openai"));
    let result = manager()
        .preserve_context_for_switch(&conversation, &conversation.model, &ContextOptions::default())
        .unwrap();

    assert!(result.messages.is_empty());
    assert_eq!(result.total_tokens, 0);
    assert!(!result.truncated);
    assert_eq!(result.strategy, ContextStrategy::FullContext);
    assert!(ContextWindowManager::validate_context_preservation(&result, 4000));
}

#[test]
fn test_no_op_below_budget() {
    let conversation = dialogue(6, 10, 1000);
    for strategy in ContextStrategy::SELECTABLE {
        let result = manager()
            .preserve_context_for_switch(
                &conversation,
                &conversation.model,
                &with_strategy(strategy),
            )
            .unwrap();
        assert_eq!(result.strategy, ContextStrategy::FullContext);
        assert_eq!(result.preserved_count, conversation.messages.len());
        assert!(!result.truncated);
        for (kept, original) in result.messages.iter().zip(&conversation.messages) {
            assert_eq!(kept.content, original.content);
            assert_eq!(kept.sequence_number, Some(original.sequence_number));
        }
    }
}

#[test]
fn test_pair_integrity_under_intelligent_truncation() {
    let manager = manager();
    for seed in 0..30 {
        let conversation = generated(seed, 24, 300);
        let result = manager
            .preserve_context_for_switch(
                &conversation,
                &conversation.model,
                &with_strategy(ContextStrategy::IntelligentTruncation),
            )
            .unwrap();
        if result.strategy == ContextStrategy::FullContext {
            continue;
        }

        let kept: Vec<u64> = result.messages.iter().filter_map(|m| m.sequence_number).collect();
        let messages = &conversation.messages;
        for (i, message) in messages.iter().enumerate().skip(1) {
            let previous = &messages[i - 1];
            let is_pair = previous.role == MessageRole::User && message.role == MessageRole::Assistant;
            if !is_pair {
                continue;
            }
            assert_eq!(
                kept.contains(&previous.sequence_number),
                kept.contains(&message.sequence_number),
                "pair {}/{} split on seed {}",
                previous.sequence_number,
                message.sequence_number,
                seed
            );
        }
    }
}

#[test]
fn test_summarized_context_reports_summary() {
    let conversation = dialogue(20, 20, 300);
    let result = manager()
        .preserve_context_for_switch(
            &conversation,
            &conversation.model,
            &with_strategy(ContextStrategy::SummarizedContext),
        )
        .unwrap();

    assert!(result.summary_created);
    let summaries: Vec<&ContextMessage> = result
        .messages
        .iter()
        .filter(|m| m.origin == MessageOrigin::Summary)
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].role, MessageRole::System);
    assert!(summaries[0].content.starts_with("Summary of"));
    assert!(result.total_tokens <= 240);
    assert_eq!(
        result.preserved_count,
        result.messages.len() - 1,
        "the summary is not a preserved message"
    );
}

#[test]
fn test_advanced_truncation_reports_importance() {
    let conversation = generated(7, 40, 400);
    let result = manager()
        .preserve_context_for_switch(
            &conversation,
            &conversation.model,
            &with_strategy(ContextStrategy::AdvancedIntelligentTruncation),
        )
        .unwrap();
    assert_eq!(result.strategy, ContextStrategy::AdvancedIntelligentTruncation);
    assert!(result.avg_importance_score.is_some());
    assert!(result.pairs_preserved.is_some());
}

#[test]
fn test_provider_defaults_drive_strategy() {
    let resolver = ConfigurationResolver::new(Default::default(), ProviderDefaultsTable::builtin());
    let manager = ContextWindowManager::new(resolver)
        .with_clock(Arc::new(FixedClock(now())))
        .with_estimator(Arc::new(WordBasedEstimator::default()));

    let mut conversation = dialogue(30, 20, 200);
    conversation.model = ModelCapacity::new(200, "Ollama");
    let result = manager
        .preserve_context_for_switch(&conversation, &conversation.model, &ContextOptions::default())
        .unwrap();

    assert_eq!(result.strategy, ContextStrategy::RecentMessages);
    assert!(result.total_tokens <= 140);
}

#[test]
fn test_model_switch_uses_target_capacity() {
    let conversation = dialogue(20, 20, 8000);
    let manager = manager();

    let large = manager
        .preserve_context_for_switch(&conversation, &conversation.model, &ContextOptions::default())
        .unwrap();
    assert!(!large.truncated);

    let small = manager
        .preserve_context_for_switch(
            &conversation,
            &ModelCapacity::new(150, "mistral"),
            &ContextOptions::default(),
        )
        .unwrap();
    assert!(small.truncated);
    assert!(small.total_tokens <= 112);
}

#[test]
fn test_apply_and_reset_settings() {
    let manager = manager();
    let store = InMemoryConversationStore::new();
    let mut conversation = dialogue(10, 20, 100);
    store.register(&conversation);

    let resolver = manager.resolver();
    let mut config = resolver.resolve(&conversation, &conversation.model);
    config.strategy = ContextStrategy::RecentMessages;
    resolver.apply(&store, &conversation, &config).unwrap();

    conversation.settings = store.load_settings(&conversation.id).unwrap();
    let result = manager
        .preserve_context_for_switch(&conversation, &conversation.model, &ContextOptions::default())
        .unwrap();
    assert_eq!(result.strategy, ContextStrategy::RecentMessages);

    let defaults = resolver.reset(&store, &conversation).unwrap();
    assert_eq!(defaults.strategy, ContextStrategy::IntelligentTruncation);
    conversation.settings = store.load_settings(&conversation.id).unwrap();
    assert!(conversation.settings.is_empty());
}

#[test]
fn test_invalid_settings_are_reported_per_field() {
    let manager = manager();
    let store = InMemoryConversationStore::new();
    let conversation = dialogue(4, 20, 1000);
    store.register(&conversation);

    let mut config = manager
        .resolver()
        .resolve(&conversation, &conversation.model);
    config.window_size = 10;
    config.relevance_threshold = 2.0;

    match manager.resolver().apply(&store, &conversation, &config) {
        Err(ContextError::InvalidConfig(errors)) => {
            let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
            assert_eq!(fields, vec!["window_size", "relevance_threshold"]);
        }
        other => panic!("expected field errors, got {:?}", other),
    }
}

#[test]
fn test_optimize_preserves_order_and_membership() {
    let mut conversation = dialogue(10, 20, 100);
    conversation.messages[9].content = "turn   nine  nine with   extra   spaces".to_string();
    let result = manager()
        .preserve_context_for_switch(
            &conversation,
            &conversation.model,
            &with_strategy(ContextStrategy::RecentMessages),
        )
        .unwrap();

    let optimized = ContextWindowManager::optimize_context(&result, &OptimizeOptions::default());
    assert_eq!(optimized.result.messages.len(), result.messages.len());
    for (after, before) in optimized.result.messages.iter().zip(&result.messages) {
        assert_eq!(after.sequence_number, before.sequence_number);
        assert!(after.token_count <= before.token_count);
    }
    assert!(optimized.tokens_saved > 0);
    assert_eq!(
        optimized.result.total_tokens + optimized.tokens_saved,
        result.total_tokens
    );
}
