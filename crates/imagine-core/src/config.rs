//! Engine configuration, loaded from environment variables or a TOML table.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::providers::retry::RetryPolicy;

/// Tunables consumed by the job manager and the provider adapters.
///
/// Every field has a default, so an empty `[engine]` table or an empty
/// environment yields a working engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the concurrency gate guarding `Running` (default: 3).
    pub max_concurrent: usize,

    /// Per-job deadline in seconds, counted from the `Running` transition.
    pub timeout_seconds: u64,

    /// Cadence for polling asynchronous providers.
    pub poll_interval_ms: u64,

    /// Total attempts per adapter call, including the first one.
    pub retry_max_attempts: u32,

    pub retry_base_delay_ms: u64,

    /// Upper bound for a single backoff sleep.
    pub retry_max_delay_ms: u64,

    /// Capacity of the scheduler's command channel.
    pub queue_capacity: usize,

    pub http_connect_timeout_secs: u64,

    pub http_request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout_seconds: 120,
            poll_interval_ms: 1500,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
            queue_capacity: 64,
            http_connect_timeout_secs: 10,
            http_request_timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Build [`EngineConfig`] from `IMAGINE_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: parse_env("IMAGINE_MAX_CONCURRENT", defaults.max_concurrent),
            timeout_seconds: parse_env("IMAGINE_TIMEOUT_SECONDS", defaults.timeout_seconds),
            poll_interval_ms: parse_env("IMAGINE_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            retry_max_attempts: parse_env(
                "IMAGINE_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            ),
            retry_base_delay_ms: parse_env(
                "IMAGINE_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            ),
            retry_max_delay_ms: parse_env("IMAGINE_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            queue_capacity: parse_env("IMAGINE_QUEUE_CAPACITY", defaults.queue_capacity),
            http_connect_timeout_secs: parse_env(
                "IMAGINE_HTTP_CONNECT_TIMEOUT_SECS",
                defaults.http_connect_timeout_secs,
            ),
            http_request_timeout_secs: parse_env(
                "IMAGINE_HTTP_REQUEST_TIMEOUT_SECS",
                defaults.http_request_timeout_secs,
            ),
        }
    }

    /// Parse the `[engine]` table of a TOML document.  A missing table yields
    /// the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct Document {
            #[serde(default)]
            engine: EngineConfig,
        }

        let doc: Document =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        doc.engine.validate()?;
        Ok(doc.engine)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("max_concurrent", self.max_concurrent == 0),
            ("timeout_seconds", self.timeout_seconds == 0),
            ("poll_interval_ms", self.poll_interval_ms == 0),
            ("retry_max_attempts", self.retry_max_attempts == 0),
            ("queue_capacity", self.queue_capacity == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ConfigError::Invalid {
                field: *field,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            factor: 2,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid engine config: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to parse engine config: {0}")]
    Parse(String),
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_engine_settings() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.timeout(), Duration::from_secs(120));
        assert!(cfg.validate().is_ok());

        let policy = cfg.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.factor, 2);
    }

    #[test]
    fn partial_toml_table_keeps_remaining_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [engine]
            max_concurrent = 5
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_concurrent, 5);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.timeout_seconds, 120);
    }

    #[test]
    fn missing_engine_table_yields_defaults() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = EngineConfig::from_toml_str("[engine]\nmax_concurrent = 0\n").unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                field: "max_concurrent",
                reason: "must be greater than zero"
            }
        );
    }

    #[test]
    fn unparseable_env_value_falls_back() {
        assert_eq!(parse_env("IMAGINE_TEST_DEFINITELY_UNSET", 7usize), 7);
    }
}
