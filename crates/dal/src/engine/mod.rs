//! # Storage Engines
//!
//! Static registry of engine implementations keyed by engine identifier.
//! Each engine is one variant behind the `StorageEngine` capability
//! interface; the rest of the layer never names a concrete engine.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod sql;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use memory::{MemoryEngine, MemoryStore};
#[cfg(feature = "postgres")]
pub use postgres::PostgresEngine;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEngine;
pub use traits::*;

use crate::error::DalError;

static ENGINES: &[&dyn StorageEngine] = &[
    &MemoryEngine,
    #[cfg(feature = "sqlite")]
    &SqliteEngine,
    #[cfg(feature = "postgres")]
    &PostgresEngine,
];

/// All engines compiled into this build
pub fn registered_engines() -> &'static [&'static dyn StorageEngine] {
    ENGINES
}

/// Canonical identifiers of all registered engines
pub fn registered_ids() -> Vec<&'static str> {
    ENGINES.iter().map(|engine| engine.id()).collect()
}

/// Resolve an engine identifier, case-insensitively, including aliases
pub fn lookup(engine_id: &str) -> Result<&'static dyn StorageEngine, DalError> {
    let wanted = engine_id.trim();

    ENGINES
        .iter()
        .copied()
        .find(|engine| {
            engine.id().eq_ignore_ascii_case(wanted)
                || engine
                    .aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(wanted))
        })
        .ok_or_else(|| DalError::UnsupportedEngine {
            engine: engine_id.to_string(),
            registered: registered_ids().join(", "),
        })
}
