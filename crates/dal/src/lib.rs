//! # Data-Access Layer
//!
//! Shared persistence abstraction for backend services. Services depend on a
//! small set of contracts and stay agnostic to the concrete storage engine,
//! the connection lifecycle and transaction boundaries.
//!
//! ## Key Features
//! - `ContextFactory` resolving engine identifiers against a static registry
//! - `UnitOfWork` coordinating staged writes into one atomic flush
//! - `RetryPolicy` re-executing logical operations on transient failures
//! - `DalContainer` binding context, unit factory and configuration per scope
//!
//! ## Design Principles
//! - Engines sit behind the `StorageEngine`/`StorageSession` capability traits
//! - Scoped resources release through ownership: dropped units roll back
//! - Retry wraps operations from the outside and never reopens a closed unit

pub mod config;
pub mod container;
pub mod context;
pub mod engine;
pub mod error;
pub mod factory;
pub mod journal;
pub mod pagination;
pub mod retry;
pub mod telemetry;
pub mod unit_of_work;

// Re-export commonly used types at the crate root for convenience
pub use config::{ConfigValidation, ContextOptions, DatabaseConfig, FlushReport, RetrySettings};
pub use container::DalContainer;
pub use context::{Collection, ContextStats, Record, StorageContext};
pub use engine::{CommitCancellation, MemoryStore, StorageEngine, StorageSession};
pub use error::*;
pub use factory::ContextFactory;
pub use pagination::{Page, Pagination};
pub use retry::{Resilient, RetryOutcome, RetryPolicy};
pub use unit_of_work::{scoped, Committed, StagedCollection, UnitOfWork, UnitState};

/// Version of the dal crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
