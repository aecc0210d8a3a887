//! SQLite engine over an sqlx pool.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::debug;

use super::sql::{record_session, SQLITE};
use super::traits::{CommitCancellation, StorageEngine, StorageSession};
use crate::config::{EngineDefaults, ResolvedOptions};
use crate::error::DalError;

record_session!(SqliteSession, sqlx::Sqlite, SQLITE, "sqlite");

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEngine;

impl SqliteEngine {
    fn parse(descriptor: &str) -> Result<SqliteConnectOptions, DalError> {
        let descriptor = descriptor.trim();
        if !descriptor.starts_with("sqlite:") {
            return Err(DalError::invalid_config(
                "connection",
                descriptor,
                "SQLite descriptors are sqlite: URLs",
            ));
        }

        SqliteConnectOptions::from_str(descriptor)
            .map_err(|e| DalError::invalid_config("connection", descriptor, e.to_string()))
    }

    fn is_in_memory(descriptor: &str) -> bool {
        descriptor.contains(":memory:") || descriptor.contains("mode=memory")
    }
}

impl StorageEngine for SqliteEngine {
    fn id(&self) -> &'static str {
        "sqlite"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["sqlite3"]
    }

    fn defaults(&self) -> EngineDefaults {
        EngineDefaults {
            max_pool_size: 5,
            lazy_connect: true,
        }
    }

    fn commit_cancellation(&self) -> CommitCancellation {
        CommitCancellation::RunToCompletion
    }

    fn validate_descriptor(&self, descriptor: &str) -> Result<(), DalError> {
        Self::parse(descriptor).map(|_| ())
    }

    fn connect(
        &self,
        descriptor: &str,
        options: &ResolvedOptions,
    ) -> Result<Box<dyn StorageSession>, DalError> {
        let connect_options = Self::parse(descriptor)?
            .create_if_missing(true)
            .busy_timeout(options.command_timeout);

        // every connection to a private in-memory database sees its own data
        let max_connections = if Self::is_in_memory(descriptor) {
            1
        } else {
            options.max_pool_size
        };

        // No idle reaping and no minimum keeps pool construction free of
        // background tasks, so sessions can be built outside a runtime.
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(0)
            .acquire_timeout(options.command_timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(connect_options);

        debug!(max_connections, "SQLite pool configured");
        Ok(Box::new(SqliteSession::new(pool, max_connections)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_validation() {
        let engine = SqliteEngine;
        assert!(engine.validate_descriptor("sqlite::memory:").is_ok());
        assert!(engine.validate_descriptor("sqlite://data/orders.db").is_ok());
        assert!(engine.validate_descriptor("orders.db").is_err());
        assert!(engine
            .validate_descriptor("sqlite://orders.db?mode=bogus")
            .is_err());
    }

    #[test]
    fn test_in_memory_detection() {
        assert!(SqliteEngine::is_in_memory("sqlite::memory:"));
        assert!(SqliteEngine::is_in_memory("sqlite://file.db?mode=memory"));
        assert!(!SqliteEngine::is_in_memory("sqlite://file.db"));
    }
}
