//! # Engine Traits
//!
//! Capability interfaces every storage engine implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EngineDefaults, ResolvedOptions};
use crate::error::{DalError, StorageFailure};
use crate::pagination::Pagination;

/// What happens when cancellation arrives while a flush is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitCancellation {
    /// The flush is abandoned and nothing it staged is applied
    AbortOnCancel,
    /// The flush runs to completion; the caller observes its real outcome
    RunToCompletion,
}

/// A registered storage engine
///
/// Engines are stateless descriptors: they validate connection descriptors
/// and build sessions, but never open physical connections themselves.
pub trait StorageEngine: Send + Sync {
    /// Canonical engine identifier
    fn id(&self) -> &'static str;

    /// Additional identifiers accepted for this engine
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Defaults applied before caller options
    fn defaults(&self) -> EngineDefaults;

    /// In-flight commit behaviour under cancellation
    fn commit_cancellation(&self) -> CommitCancellation;

    /// Reject malformed descriptors at construction time
    fn validate_descriptor(&self, descriptor: &str) -> Result<(), DalError>;

    /// Build an unopened session for `descriptor`
    fn connect(
        &self,
        descriptor: &str,
        options: &ResolvedOptions,
    ) -> Result<Box<dyn StorageSession>, DalError>;
}

/// Live session against one engine
///
/// `open` is idempotent and called lazily before the first real operation.
/// `apply` must be atomic: either every mutation in the batch is applied or
/// none is.
#[async_trait]
pub trait StorageSession: Send + Sync {
    /// Open the physical connection if not already open
    async fn open(&self) -> Result<(), StorageFailure>;

    /// Whether the physical connection has been opened and not yet closed
    fn is_open(&self) -> bool;

    /// Fetch one record body
    async fn fetch(&self, tag: &str, key: &str) -> Result<Option<Value>, StorageFailure>;

    /// Fetch record bodies of one collection, ordered by key
    async fn scan(
        &self,
        tag: &str,
        window: Option<&Pagination>,
    ) -> Result<Vec<Value>, StorageFailure>;

    /// Count records in one collection
    async fn count(&self, tag: &str) -> Result<u64, StorageFailure>;

    /// Atomically apply a batch, returning the number of affected records
    async fn apply(&self, batch: &[Mutation]) -> Result<u64, StorageFailure>;

    /// Verify the engine is reachable
    async fn ping(&self) -> Result<(), StorageFailure> {
        self.open().await
    }

    /// Release the connection
    async fn close(&self);

    /// Get connection pool statistics if available
    fn connection_stats(&self) -> Option<ConnectionStats> {
        None
    }
}

/// One staged change
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub tag: String,
    pub key: String,
    pub op: MutationOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOp {
    Insert(Value),
    Update(Value),
    Delete,
}

impl Mutation {
    pub fn insert(tag: impl Into<String>, key: impl Into<String>, body: Value) -> Self {
        Self {
            tag: tag.into(),
            key: key.into(),
            op: MutationOp::Insert(body),
        }
    }

    pub fn update(tag: impl Into<String>, key: impl Into<String>, body: Value) -> Self {
        Self {
            tag: tag.into(),
            key: key.into(),
            op: MutationOp::Update(body),
        }
    }

    pub fn delete(tag: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            key: key.into(),
            op: MutationOp::Delete,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self.op {
            MutationOp::Insert(_) => "insert",
            MutationOp::Update(_) => "update",
            MutationOp::Delete => "delete",
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
}
