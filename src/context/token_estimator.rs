//! Token estimation for text the crate synthesizes itself
//!
//! History messages arrive with precomputed token counts. Only generated
//! text (summary messages) needs an estimate.

use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

/// Counts tokens of synthesized summary text
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// cl100k_base byte-pair encoding
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    pub fn new() -> Result<Self, String> {
        let bpe = cl100k_base().map_err(|e| e.to_string())?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Whitespace word count scaled by `tokens_per_word` (1.3 by default)
#[derive(Debug, Clone, Copy)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Tiktoken when the encoding loads, word-based otherwise
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    match TiktokenEstimator::new() {
        Ok(estimator) => Arc::new(estimator),
        Err(e) => {
            warn!("tiktoken initialization failed ({}), falling back to word-based estimation", e);
            Arc::new(WordBasedEstimator::default())
        }
    }
}
