//! Token budget arithmetic for context windows
//!
//! The usable budget for conversation history is `floor(ratio * window_size)`.
//! The remainder of the window is headroom for the new turn and the model's
//! completion. Every context result must fit inside this budget.

use thiserror::Error;

/// Default fraction of the context window available to history
pub const DEFAULT_BUDGET_RATIO: f64 = 0.8;

/// Token budget errors
#[derive(Debug, Error, PartialEq)]
pub enum BudgetError {
    #[error("Invalid budget ratio {0}: must be in (0, 1]")]
    InvalidRatio(f64),
}

/// Token budget for one context build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    window_size: usize,
    limit: usize,
}

impl TokenBudget {
    /// Create a budget for a window and ratio
    pub fn new(window_size: usize, ratio: f64) -> Result<Self, BudgetError> {
        if !ratio.is_finite() || ratio <= 0.0 || ratio > 1.0 {
            return Err(BudgetError::InvalidRatio(ratio));
        }

        let limit = (window_size as f64 * ratio).floor() as usize;
        Ok(Self {
            window_size,
            limit: limit.min(window_size),
        })
    }

    /// Maximum tokens the history may occupy
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn fits(&self, tokens: usize) -> bool {
        tokens <= self.limit
    }

    /// Tokens left after `used`
    pub fn remaining(&self, used: usize) -> usize {
        self.limit.saturating_sub(used)
    }

    /// How many tokens must be shed to bring `current_total` under the limit
    pub fn calculate_shrinkage(&self, current_total: usize) -> usize {
        current_total.saturating_sub(self.limit)
    }
}
