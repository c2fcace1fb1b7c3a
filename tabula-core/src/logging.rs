//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::error::ConfigError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Build the env filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| ConfigError::Invalid {
            message: format!("invalid log filter '{}': {}", config.level, e),
        }),
    }
}

/// Install the global tracing subscriber.
///
/// Human-readable output goes to stderr; `json = true` switches to JSON lines
/// for log shippers. Calling this twice returns an error instead of panicking.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = env_filter(config)?;

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| ConfigError::Invalid {
            message: format!("tracing already initialised: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_rejects_garbage() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "tabula=notalevel".to_string(),
            json: false,
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_init_tracing_twice_is_an_error() {
        let config = LoggingConfig::default();
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        // another test in this binary may have installed a subscriber first
        assert!(first.is_err() || second.is_err());
    }
}
