//! Process-wide tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level. Logs go to stderr.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::errors::EngineError;

/// Builds the filter: `RUST_LOG` if set, else the configured directive.
pub(crate) fn build_filter(config: &LogConfig) -> Result<EnvFilter, EngineError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| EngineError::Config(format!("invalid log level {:?}: {e}", config.level))),
    }
}

/// Installs the global subscriber.
///
/// Call once at startup; a second call returns a config error.
pub fn init_logging(config: &LogConfig) -> Result<(), EngineError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if config.json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| EngineError::Config(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config() {
        let config = LogConfig {
            level: "buildflow=debug,warn".to_string(),
            json: false,
        };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LogConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
