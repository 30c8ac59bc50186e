//! Conversation context management for multi-provider chat
//!
//! On every turn the [`ContextWindowManager`](context::ContextWindowManager)
//! decides which prior messages fit a model's token window, keeps the
//! important ones, summarizes what was evicted and recalls relevant older
//! messages on demand.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod prelude;
pub mod telemetry;

pub use error::{ContextError, FieldError, Result};
