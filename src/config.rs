//! Configuration management for tokengate.
//!
//! Settings come from built-in defaults, optionally overridden by a YAML
//! file, optionally overridden by `TOKENGATE__*` environment variables
//! (for example `TOKENGATE__LIMITER__CAPACITY=20`).

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::ratelimit::{LimiterOption, DEFAULT_CAPACITY, DEFAULT_REFILL_INTERVAL};

const ENV_PREFIX: &str = "TOKENGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for tokengate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokengateConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Diagnostic output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests allowed per key before denial
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Decay cadence in milliseconds
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}

fn default_refill_interval_ms() -> u64 {
    DEFAULT_REFILL_INTERVAL.as_millis() as u64
}

impl LimiterConfig {
    /// The decay cadence as a duration.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Constructor options equivalent to this configuration.
    pub fn options(&self) -> Vec<LimiterOption> {
        vec![
            LimiterOption::Capacity(self.capacity),
            LimiterOption::RefillInterval(self.refill_interval()),
        ]
    }

    /// Reject values a limiter would refuse.
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(LimiterError::CapacityTooSmall);
        }
        if self.refill_interval_ms < 1 {
            return Err(LimiterError::RefillIntervalTooSmall);
        }
        Ok(())
    }
}

/// Diagnostic output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TokengateConfig {
    /// Load configuration from an optional YAML file layered under the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Self::environment())
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LimiterError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file {} not found", path.display()),
            )));
        }

        let config: TokengateConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TokengateConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.limiter.validate()?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: TokengateConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.limiter.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn env_of(vars: &[(&str, &str)]) -> Environment {
        TokengateConfig::environment().source(Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))
    }

    #[test]
    fn test_defaults() {
        let config = TokengateConfig::default();

        assert_eq!(config.limiter.capacity, 10);
        assert_eq!(config.limiter.refill_interval(), Duration::from_secs(1));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
limiter:
  capacity: 3
  refill_interval_ms: 500
logging:
  json: true
"#;
        let config = TokengateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiter.capacity, 3);
        assert_eq!(config.limiter.refill_interval(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.json);
    }

    #[test]
    fn test_from_yaml_partial_uses_defaults() {
        let config = TokengateConfig::from_yaml("limiter:\n  capacity: 4\n").unwrap();

        assert_eq!(config.limiter.capacity, 4);
        assert_eq!(config.limiter.refill_interval_ms, 1000);
    }

    #[test]
    fn test_from_yaml_rejects_invalid_values() {
        let err = TokengateConfig::from_yaml("limiter:\n  capacity: 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let err = TokengateConfig::from_yaml("limiter:\n  refill_interval_ms: 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let err = TokengateConfig::from_yaml("limiter:\n  capacity: many\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_environment_overrides() {
        let env = env_of(&[
            ("TOKENGATE__LIMITER__CAPACITY", "20"),
            ("TOKENGATE__LOGGING__LEVEL", "debug"),
        ]);
        let config = TokengateConfig::load_with_env(None, env).unwrap();

        assert_eq!(config.limiter.capacity, 20);
        assert_eq!(config.limiter.refill_interval_ms, 1000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file() {
        let err = TokengateConfig::from_file("/nonexistent/tokengate.yaml").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_options_round_trip_through_limiter_settings() {
        let config = LimiterConfig {
            capacity: 2,
            refill_interval_ms: 250,
        };

        let options = config.options();
        assert_eq!(options.len(), 2);
        assert!(matches!(options[0], LimiterOption::Capacity(2)));
        assert!(matches!(
            options[1],
            LimiterOption::RefillInterval(d) if d == Duration::from_millis(250)
        ));
    }
}
