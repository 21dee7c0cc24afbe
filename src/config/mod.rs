//! # Batchflow Configuration System
//!
//! Typed configuration for the orchestration engine. Every field has a
//! default, so an empty configuration is a valid single-node setup against a
//! local database.
//!
//! ## Sources
//!
//! [`ConfigManager`] layers, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. A TOML file (`BATCHFLOW_CONFIG_PATH`, else `config/batchflow.toml` if present)
//! 3. Environment variables `BATCHFLOW__<SECTION>__<KEY>`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batchflow_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?;
//! let workers = config.config().dispatcher.worker_count;
//! let poll_every = config.config().dispatcher.poll_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration of the orchestration engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherConfig,
    pub recovery: RecoveryConfig,
    pub state_machine: StateMachineConfig,
    pub events: EventsConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply bundled migrations on connect
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/batchflow_development".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Claim-and-submit workers
    pub worker_count: usize,
    /// Global ceiling on simultaneously active tasks
    pub max_in_flight: usize,
    /// Optional per-batch ceiling, at most `max_in_flight`
    pub max_in_flight_per_batch: Option<usize>,
    pub submission_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Upper bound on a single poll call; a slow poll counts as a transport error
    pub poll_request_timeout_ms: u64,
    /// Time since submission after which an unanswered item is marked TIMEOUT
    pub item_timeout_seconds: u64,
    /// Worker sleep after finding nothing to claim
    pub idle_backoff_ms: u64,
    /// Interval of the discovery sweep (STAGED promotion and progress sweep)
    pub sweep_interval_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_in_flight: 32,
            max_in_flight_per_batch: None,
            submission_timeout_ms: 30_000,
            poll_interval_ms: 2_000,
            poll_request_timeout_ms: 10_000,
            item_timeout_seconds: 600,
            idle_backoff_ms: 500,
            sweep_interval_seconds: 30,
        }
    }
}

impl DispatcherConfig {
    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_request_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_request_timeout_ms)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_seconds)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub run_on_startup: bool,
    /// Minimum age of an orphaned PROCESSING item before it is reset
    pub staleness_threshold_seconds: u64,
    /// Periodic orphan sweep; `None` runs recovery only at startup
    pub interval_seconds: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            run_on_startup: true,
            staleness_threshold_seconds: 0,
            interval_seconds: None,
        }
    }
}

impl RecoveryConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_seconds)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Retries of an engine-initiated transition after a version conflict
    pub max_cas_retries: u32,
    /// Actor recorded when a request does not name one
    pub default_actor: String,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: crate::constants::system::DEFAULT_MAX_CAS_RETRIES,
            default_actor: crate::constants::actors::OPERATOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: crate::constants::system::DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive; `RUST_LOG` takes precedence
    pub log_level: Option<String>,
    pub log_format: LogFormat,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            log_format: LogFormat::Pretty,
            service_name: "batchflow".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Validate cross-field constraints the types cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "database configuration",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                0,
                "pool size must be greater than 0",
            ));
        }

        let dispatcher = &self.dispatcher;
        if dispatcher.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.worker_count",
                0,
                "at least one worker is required",
            ));
        }

        if dispatcher.max_in_flight == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.max_in_flight",
                0,
                "ceiling must be greater than 0",
            ));
        }

        if let Some(per_batch) = dispatcher.max_in_flight_per_batch {
            if per_batch == 0 || per_batch > dispatcher.max_in_flight {
                return Err(ConfigurationError::invalid_value(
                    "dispatcher.max_in_flight_per_batch",
                    per_batch,
                    format!(
                        "must be between 1 and max_in_flight ({})",
                        dispatcher.max_in_flight
                    ),
                ));
            }
        }

        if dispatcher.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.poll_interval_ms",
                0,
                "poll interval must be greater than 0",
            ));
        }

        if dispatcher.submission_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.submission_timeout_ms",
                0,
                "submission timeout must be greater than 0",
            ));
        }

        if dispatcher.sweep_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.sweep_interval_seconds",
                0,
                "sweep interval must be greater than 0",
            ));
        }

        if self.recovery.interval_seconds == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "recovery.interval_seconds",
                0,
                "omit the interval to disable periodic recovery",
            ));
        }

        // A live pass with no grace period would race claims that are not yet registered
        if self.recovery.interval_seconds.is_some() && self.recovery.staleness_threshold_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "recovery.staleness_threshold_seconds",
                0,
                "periodic recovery needs a staleness threshold greater than 0",
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                0,
                "channel capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.recovery.staleness_threshold(), Duration::ZERO);
        assert_eq!(config.recovery.interval(), None);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatcher.worker_count"));
    }

    #[test]
    fn test_per_batch_ceiling_bounded_by_global() {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.max_in_flight = 8;
        config.dispatcher.max_in_flight_per_batch = Some(9);
        assert!(config.validate().is_err());

        config.dispatcher.max_in_flight_per_batch = Some(8);
        assert!(config.validate().is_ok());

        config.dispatcher.max_in_flight_per_batch = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = OrchestratorConfig::default();
        config.dispatcher.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "dispatcher": {"worker_count": 2},
            "telemetry": {"log_format": "json"}
        }))
        .unwrap();
        assert_eq!(config.dispatcher.worker_count, 2);
        assert_eq!(config.dispatcher.max_in_flight, 32);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert_eq!(config.state_machine.default_actor, "operator");
    }
}
