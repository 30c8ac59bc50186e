//! Summaries of evicted conversation history
//!
//! `summarized_context` replaces the evicted middle of a conversation with a
//! single system-role message. The summarizer only sees the evicted records.

use std::collections::HashMap;

use super::models::{MessageRecord, MessageRole};
use super::text::content_words;

/// Summarizer trait for different summarization strategies
pub trait Summarizer: Send + Sync {
    /// Summarize evicted messages into a single block of text
    fn summarize(&self, evicted: &[&MessageRecord]) -> String;
}

/// Names message counts and the most frequent topics
#[derive(Debug, Clone)]
pub struct TopicSummarizer {
    max_topics: usize,
    min_topic_len: usize,
}

impl TopicSummarizer {
    pub fn new(max_topics: usize) -> Self {
        Self {
            max_topics,
            min_topic_len: 4,
        }
    }

    fn topics(&self, evicted: &[&MessageRecord]) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for message in evicted.iter().filter(|m| !m.is_system()) {
            for word in content_words(&message.content) {
                if word.chars().count() >= self.min_topic_len
                    && word.chars().all(|c| c.is_alphabetic())
                {
                    *counts.entry(word).or_insert(0) += 1;
                }
            }
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .take(self.max_topics)
            .map(|(word, _)| word)
            .collect()
    }
}

impl Default for TopicSummarizer {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Summarizer for TopicSummarizer {
    fn summarize(&self, evicted: &[&MessageRecord]) -> String {
        let count_role =
            |role: MessageRole| evicted.iter().filter(|m| m.role == role).count();
        let users = count_role(MessageRole::User);
        let assistants = count_role(MessageRole::Assistant);
        let others = evicted.len() - users - assistants;

        let mut summary = format!(
            "Summary of {} earlier messages ({} from user, {} from assistant",
            evicted.len(),
            users,
            assistants
        );
        if others > 0 {
            summary.push_str(&format!(", {} other", others));
        }
        summary.push_str(").");

        let topics = self.topics(evicted);
        if !topics.is_empty() {
            summary.push_str(&format!(" Topics discussed: {}.", topics.join(", ")));
        }

        summary
    }
}

/// Simple concatenation of short excerpts (fallback)
#[derive(Debug, Clone)]
pub struct ConcatenationSummarizer {
    max_excerpt_chars: usize,
}

impl ConcatenationSummarizer {
    pub fn new(max_excerpt_chars: usize) -> Self {
        Self { max_excerpt_chars }
    }
}

impl Default for ConcatenationSummarizer {
    fn default() -> Self {
        Self::new(80)
    }
}

impl Summarizer for ConcatenationSummarizer {
    fn summarize(&self, evicted: &[&MessageRecord]) -> String {
        let mut lines = vec!["Earlier conversation:".to_string()];
        for message in evicted {
            let flattened = message.content.split_whitespace().collect::<Vec<_>>().join(" ");
            let excerpt: String = flattened.chars().take(self.max_excerpt_chars).collect();
            let ellipsis = if flattened.chars().count() > self.max_excerpt_chars {
                "..."
            } else {
                ""
            };
            lines.push(format!("- {}: {}{}", message.role, excerpt, ellipsis));
        }
        lines.join("\n")
    }
}
