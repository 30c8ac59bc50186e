//! Error types for context management

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::context::token_budget::BudgetError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ContextError>;

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Context management errors
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {}", join_field_errors(.0))]
    InvalidConfig(Vec<FieldError>),

    #[error("Invalid conversation {conversation_id}: {reason}")]
    InvalidConversation {
        conversation_id: String,
        reason: String,
    },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error(transparent)]
    Budget(#[from] BudgetError),
}

impl From<::config::ConfigError> for ContextError {
    fn from(err: ::config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_lists_every_field() {
        let err = ContextError::InvalidConfig(vec![
            FieldError::new("ratio", "must be in (0, 1]"),
            FieldError::new("window_size", "must be at least 100"),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("ratio: must be in (0, 1]"));
        assert!(rendered.contains("window_size: must be at least 100"));
    }
}
