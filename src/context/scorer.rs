//! Preservation scoring for conversation messages
//!
//! Every message gets a set of markers describing why it might deserve to
//! survive truncation (system instruction, question, code, stated preference,
//! recency, conversational pairing, ...) and a priority score computed as a
//! weighted sum over those markers.
//!
//! Weights are a tunable table. Two orderings hold for any valid table:
//! - scores never decrease as markers are added (all weights non-negative)
//! - a system message outranks any non-system message with the same number
//!   of markers (system weight exceeds the sum of all other weights)

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::models::{MessageRecord, MessageRole};
use crate::error::FieldError;

static INTERROGATIVE_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(what|why|how|when|where|who|whom|whose|which|can|could|would|should|is|are|was|were|do|does|did|will|have|has)\b")
        .expect("interrogative pattern is valid")
});

static IMPORTANT_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(important|critical|crucial|essential|remember|note that|don't forget|do not forget|make sure|keep in mind|password|passwd|api[ _-]?key|secret|access token|credentials?)\b")
        .expect("important-content pattern is valid")
});

static INLINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`[^`\n]+`").expect("inline code pattern is valid"));

static USER_PREFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(my favou?rite|i prefer|i like|i love|i hate|i dislike|i don't like|i do not like|i always|i usually|i'd rather|i would rather)\b")
        .expect("preference pattern is valid")
});

static PROBLEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|errors|exception|bug|issue|problem|fails?|failed|failing|failure|crash(es|ed)?|broken|not working|doesn't work|does not work|panic(ked)?)\b")
        .expect("problem pattern is valid")
});

static SOLUTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(fix|fixed|fixes|solution|solved|solves|resolve[ds]?|workaround|try this|you can|you should|should work|the answer is|to fix)\b")
        .expect("solution pattern is valid")
});

static CONTEXT_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(as (we|i|you) (discussed|mentioned|said)|earlier (you|i|we) (said|mentioned|discussed)|remember when|like i said|as mentioned|you told me|we talked about|going back to)")
        .expect("context reference pattern is valid")
});

static FOLLOW_UP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(also|and what about|what about|how about|and|additionally|another question|follow[- ]up|one more thing)\b")
        .expect("follow-up pattern is valid")
});

/// Reason a message might deserve retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreservationMarker {
    SystemMessage,
    Question,
    ImportantContent,
    CodeContent,
    UserPreference,
    ErrorOrProblem,
    Solution,
    ContextReference,
    DetailedContent,
    Recent,
    QuestionInPair,
    AnswerInPair,
    FollowUpQuestion,
}

impl PreservationMarker {
    pub const ALL: [PreservationMarker; 13] = [
        PreservationMarker::SystemMessage,
        PreservationMarker::Question,
        PreservationMarker::ImportantContent,
        PreservationMarker::CodeContent,
        PreservationMarker::UserPreference,
        PreservationMarker::ErrorOrProblem,
        PreservationMarker::Solution,
        PreservationMarker::ContextReference,
        PreservationMarker::DetailedContent,
        PreservationMarker::Recent,
        PreservationMarker::QuestionInPair,
        PreservationMarker::AnswerInPair,
        PreservationMarker::FollowUpQuestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PreservationMarker::SystemMessage => "system_message",
            PreservationMarker::Question => "question",
            PreservationMarker::ImportantContent => "important_content",
            PreservationMarker::CodeContent => "code_content",
            PreservationMarker::UserPreference => "user_preference",
            PreservationMarker::ErrorOrProblem => "error_or_problem",
            PreservationMarker::Solution => "solution",
            PreservationMarker::ContextReference => "context_reference",
            PreservationMarker::DetailedContent => "detailed_content",
            PreservationMarker::Recent => "recent",
            PreservationMarker::QuestionInPair => "question_in_pair",
            PreservationMarker::AnswerInPair => "answer_in_pair",
            PreservationMarker::FollowUpQuestion => "follow_up_question",
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            PreservationMarker::SystemMessage => "system instruction",
            PreservationMarker::Question => "asks a question",
            PreservationMarker::ImportantContent => "flagged as important",
            PreservationMarker::CodeContent => "contains code",
            PreservationMarker::UserPreference => "states a user preference",
            PreservationMarker::ErrorOrProblem => "describes a problem",
            PreservationMarker::Solution => "offers a solution",
            PreservationMarker::ContextReference => "refers to earlier turns",
            PreservationMarker::DetailedContent => "detailed content",
            PreservationMarker::Recent => "recent",
            PreservationMarker::QuestionInPair => "question with answer",
            PreservationMarker::AnswerInPair => "answer to question",
            PreservationMarker::FollowUpQuestion => "follow-up question",
        }
    }
}

/// Weight table for the priority score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerWeights {
    pub system_message: f64,
    pub question: f64,
    pub important_content: f64,
    pub code_content: f64,
    pub user_preference: f64,
    pub error_or_problem: f64,
    pub solution: f64,
    pub context_reference: f64,
    pub detailed_content: f64,
    pub recent: f64,
    pub question_in_pair: f64,
    pub answer_in_pair: f64,
    pub follow_up_question: f64,
}

impl Default for MarkerWeights {
    fn default() -> Self {
        Self {
            system_message: 3.0,
            question: 0.35,
            important_content: 0.45,
            code_content: 0.35,
            user_preference: 0.4,
            error_or_problem: 0.25,
            solution: 0.3,
            context_reference: 0.2,
            detailed_content: 0.15,
            recent: 0.1,
            question_in_pair: 0.1,
            answer_in_pair: 0.1,
            follow_up_question: 0.15,
        }
    }
}

impl MarkerWeights {
    pub fn weight(&self, marker: PreservationMarker) -> f64 {
        match marker {
            PreservationMarker::SystemMessage => self.system_message,
            PreservationMarker::Question => self.question,
            PreservationMarker::ImportantContent => self.important_content,
            PreservationMarker::CodeContent => self.code_content,
            PreservationMarker::UserPreference => self.user_preference,
            PreservationMarker::ErrorOrProblem => self.error_or_problem,
            PreservationMarker::Solution => self.solution,
            PreservationMarker::ContextReference => self.context_reference,
            PreservationMarker::DetailedContent => self.detailed_content,
            PreservationMarker::Recent => self.recent,
            PreservationMarker::QuestionInPair => self.question_in_pair,
            PreservationMarker::AnswerInPair => self.answer_in_pair,
            PreservationMarker::FollowUpQuestion => self.follow_up_question,
        }
    }

    /// Check the ordering guarantees hold for this table
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        for marker in PreservationMarker::ALL {
            let weight = self.weight(marker);
            if !weight.is_finite() || weight < 0.0 {
                errors.push(FieldError::new(
                    format!("weights.{}", marker.as_str()),
                    "must be a non-negative number",
                ));
            }
        }

        let others: f64 = PreservationMarker::ALL
            .iter()
            .filter(|m| **m != PreservationMarker::SystemMessage)
            .map(|m| self.weight(*m))
            .sum();
        if self.system_message <= others {
            errors.push(FieldError::new(
                "weights.system_message",
                format!("must exceed the sum of all other weights ({:.2})", others),
            ));
        }

        errors
    }
}

fn default_recency_window_minutes() -> i64 {
    60
}

fn default_detailed_length_threshold() -> usize {
    500
}

/// Scorer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Messages younger than this are marked `recent`
    #[serde(default = "default_recency_window_minutes")]
    pub recency_window_minutes: i64,

    /// Character count above which content is `detailed_content`
    #[serde(default = "default_detailed_length_threshold")]
    pub detailed_length_threshold: usize,

    #[serde(default)]
    pub weights: MarkerWeights,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            recency_window_minutes: default_recency_window_minutes(),
            detailed_length_threshold: default_detailed_length_threshold(),
            weights: MarkerWeights::default(),
        }
    }
}

/// Markers and score for one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservationInfo {
    pub markers: BTreeSet<PreservationMarker>,
    pub priority_score: f64,
    pub reason: String,
    /// Sequence number of the adjacent problem or solution this message pairs with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_to: Option<u64>,
}

impl PreservationInfo {
    pub fn has(&self, marker: PreservationMarker) -> bool {
        self.markers.contains(&marker)
    }
}

/// Sequence number to preservation info, in message order
pub type MarkerMap = IndexMap<u64, PreservationInfo>;

/// Computes preservation markers and priority scores
#[derive(Debug, Clone, Default)]
pub struct PreservationScorer {
    config: ScorerConfig,
}

impl PreservationScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score an ordered message set as of `now`
    pub fn score(&self, messages: &[MessageRecord], now: DateTime<Utc>) -> MarkerMap {
        let mut marker_sets: Vec<BTreeSet<PreservationMarker>> = messages
            .iter()
            .map(|m| self.content_markers(m, now))
            .collect();
        let mut links: Vec<Option<u64>> = vec![None; messages.len()];

        for i in 0..messages.len() {
            let Some(next) = messages.get(i + 1) else {
                break;
            };
            let current = &messages[i];

            if current.role == MessageRole::User
                && marker_sets[i].contains(&PreservationMarker::Question)
                && next.role == MessageRole::Assistant
            {
                marker_sets[i].insert(PreservationMarker::QuestionInPair);
                marker_sets[i + 1].insert(PreservationMarker::AnswerInPair);
            }

            if marker_sets[i].contains(&PreservationMarker::ErrorOrProblem)
                && marker_sets[i + 1].contains(&PreservationMarker::Solution)
            {
                links[i] = Some(next.sequence_number);
                links[i + 1] = Some(current.sequence_number);
            }
        }

        for i in 2..messages.len() {
            if messages[i].role == MessageRole::User
                && marker_sets[i - 1].contains(&PreservationMarker::AnswerInPair)
                && marker_sets[i - 2].contains(&PreservationMarker::QuestionInPair)
                && FOLLOW_UP.is_match(&messages[i].content)
            {
                marker_sets[i].insert(PreservationMarker::FollowUpQuestion);
            }
        }

        messages
            .iter()
            .zip(marker_sets)
            .zip(links)
            .map(|((message, markers), linked_to)| {
                let priority_score = self.priority(&markers);
                let reason = Self::reason(&markers, linked_to);
                (
                    message.sequence_number,
                    PreservationInfo {
                        markers,
                        priority_score,
                        reason,
                        linked_to,
                    },
                )
            })
            .collect()
    }

    /// Markers that depend only on the message itself
    pub fn content_markers(
        &self,
        message: &MessageRecord,
        now: DateTime<Utc>,
    ) -> BTreeSet<PreservationMarker> {
        let mut markers = BTreeSet::new();
        let content = message.content.as_str();

        if message.is_system() {
            markers.insert(PreservationMarker::SystemMessage);
        }
        if content.contains('?') || INTERROGATIVE_START.is_match(content) {
            markers.insert(PreservationMarker::Question);
        }
        if IMPORTANT_CONTENT.is_match(content) {
            markers.insert(PreservationMarker::ImportantContent);
        }
        if content.contains("```") || INLINE_CODE.is_match(content) {
            markers.insert(PreservationMarker::CodeContent);
        }
        if message.role == MessageRole::User && USER_PREFERENCE.is_match(content) {
            markers.insert(PreservationMarker::UserPreference);
        }
        if PROBLEM.is_match(content) {
            markers.insert(PreservationMarker::ErrorOrProblem);
        }
        if SOLUTION.is_match(content) {
            markers.insert(PreservationMarker::Solution);
        }
        if CONTEXT_REFERENCE.is_match(content) {
            markers.insert(PreservationMarker::ContextReference);
        }
        if content.chars().count() > self.config.detailed_length_threshold {
            markers.insert(PreservationMarker::DetailedContent);
        }
        if now.signed_duration_since(message.created_at)
            < Duration::minutes(self.config.recency_window_minutes)
        {
            markers.insert(PreservationMarker::Recent);
        }

        markers
    }

    /// Weighted sum over present markers
    pub fn priority(&self, markers: &BTreeSet<PreservationMarker>) -> f64 {
        markers
            .iter()
            .map(|m| self.config.weights.weight(*m))
            .sum()
    }

    fn reason(markers: &BTreeSet<PreservationMarker>, linked_to: Option<u64>) -> String {
        let mut parts: Vec<String> = markers.iter().map(|m| m.describe().to_string()).collect();
        if let Some(seq) = linked_to {
            parts.push(format!("linked to message #{}", seq));
        }
        if parts.is_empty() {
            "no preservation markers".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Messages carrying any of `required` (when non-empty) and scoring at least `min_score`
    pub fn filter_by_markers<'a>(
        messages: &'a [MessageRecord],
        marker_map: &MarkerMap,
        required: &[PreservationMarker],
        min_score: f64,
    ) -> Vec<&'a MessageRecord> {
        messages
            .iter()
            .filter(|message| {
                let Some(info) = marker_map.get(&message.sequence_number) else {
                    return false;
                };
                let has_required =
                    required.is_empty() || required.iter().any(|marker| info.has(*marker));
                has_required && info.priority_score >= min_score
            })
            .collect()
    }
}
