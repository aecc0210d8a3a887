//! # Configuration Types
//!
//! `DatabaseConfig` as supplied by the hosting service's configuration
//! loading. The layer only validates configuration; it never loads it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine;
use crate::error::{DalError, DataAccessError};

/// Commands running longer than this produce a warning
const LONG_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Database configuration for one logical connection scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Registered engine identifier ("memory", "sqlite", "postgres")
    pub engine: String,

    /// Engine-specific connection descriptor
    pub connection: String,

    /// Retries after the first attempt for transient failures
    pub max_retry_attempts: u32,

    /// Timeout applied to every storage command, in seconds
    pub command_timeout_secs: u64,

    /// Backoff shape between retry attempts
    pub retry: RetrySettings,

    /// Connection pool size override; engine default when unset
    pub max_pool_size: Option<u32>,

    /// Open the physical connection on first use instead of at container construction
    pub lazy_connect: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            connection: "sqlite::memory:".to_string(),
            max_retry_attempts: 3,
            command_timeout_secs: 30,
            retry: RetrySettings::default(),
            max_pool_size: None,
            lazy_connect: true,
        }
    }
}

impl DatabaseConfig {
    /// Build and validate a configuration
    pub fn new(
        engine: impl Into<String>,
        connection: impl Into<String>,
        max_retry_attempts: u32,
        command_timeout_secs: u64,
    ) -> Result<Self, DalError> {
        let config = Self {
            engine: engine.into(),
            connection: connection.into(),
            max_retry_attempts,
            command_timeout_secs,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }
}

/// Backoff between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor applied per retry
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Common configuration validation trait
pub trait ConfigValidation {
    type Error: DataAccessError;

    /// Validate the configuration
    fn validate(&self) -> Result<(), Self::Error>;

    /// Get configuration warnings (non-fatal issues)
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

impl ConfigValidation for DatabaseConfig {
    type Error = DalError;

    fn validate(&self) -> Result<(), Self::Error> {
        let engine = engine::lookup(&self.engine)?;

        if self.connection.trim().is_empty() {
            return Err(DalError::invalid_config(
                "connection",
                &self.connection,
                "Connection descriptor cannot be empty",
            ));
        }
        engine.validate_descriptor(&self.connection)?;

        if self.command_timeout_secs == 0 {
            return Err(DalError::invalid_config(
                "command_timeout_secs",
                self.command_timeout_secs,
                "Command timeout must be greater than 0 seconds",
            ));
        }

        if let Some(size) = self.max_pool_size {
            if size == 0 {
                return Err(DalError::invalid_config(
                    "max_pool_size",
                    size,
                    "Pool size must be greater than 0",
                ));
            }
        }

        self.retry.validate()
    }

    fn warnings(&self) -> Vec<String> {
        let mut warnings = self.retry.warnings();

        if self.max_retry_attempts == 0 {
            warnings.push(
                "max_retry_attempts is 0: transient failures surface after a single attempt"
                    .to_string(),
            );
        }

        if self.command_timeout_secs > LONG_COMMAND_TIMEOUT_SECS {
            warnings.push(format!(
                "command_timeout_secs is {}s: a stalled command holds its scope that long",
                self.command_timeout_secs
            ));
        }

        warnings
    }
}

impl ConfigValidation for RetrySettings {
    type Error = DalError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.base_delay_ms == 0 {
            return Err(DalError::invalid_config(
                "retry.base_delay_ms",
                self.base_delay_ms,
                "Base delay must be greater than 0",
            ));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(DalError::invalid_config(
                "retry.max_delay_ms",
                self.max_delay_ms,
                "Max delay cannot be lower than the base delay",
            ));
        }

        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DalError::invalid_config(
                "retry.multiplier",
                self.multiplier,
                "Multiplier must be a finite value of at least 1.0",
            ));
        }

        Ok(())
    }

    fn warnings(&self) -> Vec<String> {
        if self.jitter {
            Vec::new()
        } else {
            vec!["retry.jitter is disabled: concurrent callers retry in lockstep".to_string()]
        }
    }
}
