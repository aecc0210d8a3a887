//! # Unit of Work
//!
//! Groups staged mutations against one storage context and decides their fate
//! exactly once: committed as one atomic flush, or rolled back.
//!
//! ```text
//! Open --commit ok--> Committed
//! Open --commit failure | rollback | drop--> RolledBack
//! ```

use std::fmt;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{encode, Collection, Record, StorageContext};
use crate::engine::Mutation;
use crate::error::DalError;
use crate::journal;
use crate::pagination::{Page, Pagination};
use crate::telemetry;

/// Lifecycle state of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Open => write!(f, "open"),
            UnitState::Committed => write!(f, "committed"),
            UnitState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Exclusive write scope over one storage context
///
/// At most one unit is open per context. Dropping an open unit rolls it back.
pub struct UnitOfWork<'c> {
    context: &'c StorageContext,
    state: UnitState,
}

impl<'c> UnitOfWork<'c> {
    /// Open a unit on `context`
    pub fn begin(context: &'c StorageContext) -> Result<Self, DalError> {
        context.try_claim_unit()?;
        debug!(engine = context.engine(), "Unit of work opened");
        Ok(Self {
            context,
            state: UnitState::Open,
        })
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == UnitState::Open
    }

    pub fn context(&self) -> &'c StorageContext {
        self.context
    }

    /// Mutations staged and not yet flushed
    pub fn pending(&self) -> usize {
        if self.is_open() {
            self.context.staged_count()
        } else {
            0
        }
    }

    /// Read and staging handle over the collection tagged `R::TAG`
    pub fn collection<R: Record>(&self) -> StagedCollection<'_, 'c, R> {
        StagedCollection {
            unit: self,
            _record: PhantomData,
        }
    }

    /// Persist staged mutations and close the unit
    ///
    /// On failure the unit is rolled back and the error propagated.
    pub async fn commit(&mut self) -> Result<u64, DalError> {
        self.commit_inner(None).await
    }

    /// Like `commit`, stopping early if `cancel` fires
    pub async fn commit_with_cancel(&mut self, cancel: &CancellationToken) -> Result<u64, DalError> {
        self.commit_inner(Some(cancel)).await
    }

    /// Discard staged mutations and close the unit
    ///
    /// Rolling back a rolled-back unit is a no-op; a committed unit cannot be
    /// rolled back.
    pub fn rollback(&mut self) -> Result<(), DalError> {
        match self.state {
            UnitState::Open => {
                self.close_rolled_back("rollback requested");
                Ok(())
            }
            UnitState::RolledBack => Ok(()),
            UnitState::Committed => Err(DalError::invalid_state(
                "cannot roll back a committed unit of work",
            )),
        }
    }

    async fn commit_inner(&mut self, cancel: Option<&CancellationToken>) -> Result<u64, DalError> {
        if self.state != UnitState::Open {
            return Err(DalError::invalid_state(format!(
                "cannot commit a {} unit of work",
                self.state
            )));
        }

        let mutations = self.context.staged_count();
        let flushed = self.context.flush(cancel).await;

        match flushed {
            Ok(affected) => {
                self.state = UnitState::Committed;
                self.context.release_unit();
                telemetry::record_unit_committed(self.context.engine());
                journal::log_unit_committed(self.context.engine(), mutations, affected);
                Ok(affected)
            }
            Err(err) => {
                self.close_rolled_back("commit failed");
                Err(err)
            }
        }
    }

    fn close_rolled_back(&mut self, reason: &str) {
        let discarded = self.context.discard_staged();
        self.state = UnitState::RolledBack;
        self.context.release_unit();
        telemetry::record_unit_rolled_back(self.context.engine());
        journal::log_unit_rolled_back(self.context.engine(), discarded, reason);
    }

    fn ensure_open(&self) -> Result<(), DalError> {
        if self.state != UnitState::Open {
            return Err(DalError::invalid_state(format!(
                "cannot stage changes on a {} unit of work",
                self.state
            )));
        }
        Ok(())
    }

    fn stage(&self, mutation: Mutation) -> Result<(), DalError> {
        self.ensure_open()?;
        self.context.stage(mutation)
    }
}

impl fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("engine", &self.context.engine())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if self.state == UnitState::Open {
            warn!(
                engine = self.context.engine(),
                pending = self.context.staged_count(),
                "Unit of work dropped while open; rolling back"
            );
            self.close_rolled_back("dropped while open");
        }
    }
}

/// Collection handle that stages writes through a unit of work
pub struct StagedCollection<'u, 'c, R> {
    unit: &'u UnitOfWork<'c>,
    _record: PhantomData<fn() -> R>,
}

impl<'u, 'c, R: Record> StagedCollection<'u, 'c, R> {
    fn reads(&self) -> Collection<'c, R> {
        self.unit.context.collection::<R>()
    }

    /// Stage an insert; flushing fails if the key already exists
    pub fn add(&self, record: &R) -> Result<(), DalError> {
        self.unit.ensure_open()?;
        let body = encode(record)?;
        self.unit.stage(Mutation::insert(R::TAG, record.key(), body))
    }

    /// Stage a full replacement of an existing record
    pub fn update(&self, record: &R) -> Result<(), DalError> {
        self.unit.ensure_open()?;
        let body = encode(record)?;
        self.unit.stage(Mutation::update(R::TAG, record.key(), body))
    }

    /// Stage removal of the record stored under `key`
    pub fn remove(&self, key: &str) -> Result<(), DalError> {
        self.unit.stage(Mutation::delete(R::TAG, key))
    }

    pub async fn find(&self, key: &str) -> Result<Option<R>, DalError> {
        self.reads().find(key).await
    }

    pub async fn all(&self) -> Result<Vec<R>, DalError> {
        self.reads().all().await
    }

    pub async fn count(&self) -> Result<u64, DalError> {
        self.reads().count().await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, DalError> {
        self.reads().contains(key).await
    }

    pub async fn page(&self, pagination: Pagination) -> Result<Page<R>, DalError> {
        self.reads().page(pagination).await
    }
}

/// Result of a committed scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    pub affected: u64,
}

/// Run `work` inside a fresh unit of work
///
/// Commits when `work` succeeds and rolls back when it fails. This is the
/// natural boundary for a retry policy: every attempt gets its own unit.
///
/// ```no_run
/// # use dal::{scoped, DalError, StorageContext};
/// # async fn demo(context: &StorageContext) -> Result<(), DalError> {
/// let committed = scoped(context, |unit| {
///     Box::pin(async move {
///         let _ = unit;
///         Ok::<_, DalError>(())
///     })
/// })
/// .await?;
/// assert_eq!(committed.affected, 0);
/// # Ok(())
/// # }
/// ```
pub async fn scoped<'c, T, F>(context: &'c StorageContext, work: F) -> Result<Committed<T>, DalError>
where
    F: for<'u> FnOnce(&'u UnitOfWork<'c>) -> BoxFuture<'u, Result<T, DalError>>,
{
    let mut unit = UnitOfWork::begin(context)?;

    let outcome = work(&unit).await;
    let value = match outcome {
        Ok(value) => value,
        Err(err) => {
            unit.close_rolled_back("scope failed");
            return Err(err);
        }
    };

    let affected = unit.commit().await?;
    Ok(Committed { value, affected })
}
