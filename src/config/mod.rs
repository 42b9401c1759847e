//! # Procflow Configuration
//!
//! Typed configuration for the orchestration core. Every section has sensible
//! defaults so `WorkflowConfig::default()` is always a valid configuration;
//! files and environment variables only override what they name.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use procflow_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // config/procflow.toml (if present) + PROCFLOW__SECTION__KEY overrides
//! let manager = ConfigManager::load()?;
//! let lock_timeout = manager.config().engine.lock_timeout();
//! # let _ = lock_timeout;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::MAX_NODE_OFFSET_SECONDS;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Per-process exclusivity and conflict retry
    pub engine: EngineConfig,

    /// Task defaults and background sweeps
    pub scheduler: SchedulerConfig,

    /// Event delivery
    pub events: EventsConfig,

    /// Audit trail writes
    pub history: HistoryConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an operation waits for the per-process lock
    pub lock_timeout_ms: u64,
    /// Bounded retries of an optimistic version conflict
    pub max_conflict_retries: u32,
    pub conflict_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            max_conflict_retries: 3,
            conflict_backoff_ms: 25,
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub sweep_interval_seconds: u64,
    /// Due date applied to tasks whose node has no due offset
    pub default_due_hours: Option<i64>,
    pub sweep_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 60,
            default_due_hours: None,
            sweep_batch_size: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the broadcast tap
    pub buffer_size: usize,
    pub delivery_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Undelivered events kept for redelivery; oldest dropped beyond this
    pub max_pending: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            delivery_attempts: 3,
            retry_backoff_ms: 50,
            max_pending: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub append_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_dead_letters: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            append_attempts: 3,
            retry_backoff_ms: 25,
            max_dead_letters: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset; derived from the
    /// environment when absent
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl WorkflowConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.lock_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "engine.lock_timeout_ms",
                "0",
                "lock timeout must be greater than 0",
            ));
        }

        if self.scheduler.sweep_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.sweep_interval_seconds",
                "0",
                "sweep interval must be greater than 0",
            ));
        }

        if self.scheduler.sweep_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.sweep_batch_size",
                "0",
                "batch size must be greater than 0",
            ));
        }

        if let Some(hours) = self.scheduler.default_due_hours {
            if hours <= 0 {
                return Err(ConfigurationError::invalid_value(
                    "scheduler.default_due_hours",
                    hours.to_string(),
                    "default due offset must be positive",
                ));
            }
            if hours > MAX_NODE_OFFSET_SECONDS / 3600 {
                return Err(ConfigurationError::invalid_value(
                    "scheduler.default_due_hours",
                    hours.to_string(),
                    "default due offset exceeds 100 years",
                ));
            }
        }

        if self.events.buffer_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.buffer_size",
                "0",
                "broadcast capacity must be greater than 0",
            ));
        }

        if self.events.delivery_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.delivery_attempts",
                "0",
                "at least one delivery attempt is required",
            ));
        }

        if self.history.append_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "history.append_attempts",
                "0",
                "at least one append attempt is required",
            ));
        }

        if let Some(level) = &self.logging.level {
            if level.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "logging.level",
                    "logging configuration",
                ));
            }
        }

        Ok(())
    }
}
