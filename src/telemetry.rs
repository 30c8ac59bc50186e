//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ContextError, Result};

/// Install the global subscriber. `RUST_LOG` takes precedence over `config.level`.
///
/// Fails if the filter is malformed or a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ContextError::Configuration(format!("invalid log filter: {}", e)))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ContextError::Configuration(format!("tracing already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        // The global subscriber can only be set once per process
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
