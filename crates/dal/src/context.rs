//! # Storage Context
//!
//! A logical connection to one engine. Reads go straight through typed
//! collection handles; writes are staged by a unit of work and flushed as one
//! atomic batch by `persist_changes`.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FlushReport, ResolvedOptions};
use crate::engine::{
    CommitCancellation, ConnectionStats, Mutation, StorageEngine, StorageSession,
};
use crate::error::{DalError, FailureKind, StorageFailure};
use crate::journal;
use crate::pagination::{Page, Pagination};
use crate::telemetry;

/// A typed record stored in a named collection
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// Shape tag naming the collection
    const TAG: &'static str;

    /// Identity of the record within its collection
    fn key(&self) -> String;
}

pub(crate) fn encode<R: Record>(record: &R) -> Result<Value, DalError> {
    serde_json::to_value(record).map_err(|e| {
        StorageFailure::with_source(
            FailureKind::Encoding,
            format!("cannot encode '{}' record", R::TAG),
            e,
        )
        .into()
    })
}

fn decode<R: Record>(body: Value) -> Result<R, DalError> {
    serde_json::from_value(body).map_err(|e| {
        StorageFailure::with_source(
            FailureKind::Encoding,
            format!("cannot decode '{}' record", R::TAG),
            e,
        )
        .into()
    })
}

/// Snapshot of a context's lifetime counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub engine: &'static str,
    pub opened: bool,
    pub flushes: u64,
    pub records_affected: u64,
    pub pool: Option<ConnectionStats>,
}

/// Logical connection to one storage engine
pub struct StorageContext {
    engine: &'static dyn StorageEngine,
    session: Box<dyn StorageSession>,
    options: ResolvedOptions,
    staged: Mutex<Vec<Mutation>>,
    unit_open: AtomicBool,
    disposed: AtomicBool,
    flushes: AtomicU64,
    records_affected: AtomicU64,
}

impl StorageContext {
    pub(crate) fn new(
        engine: &'static dyn StorageEngine,
        session: Box<dyn StorageSession>,
        options: ResolvedOptions,
    ) -> Self {
        Self {
            engine,
            session,
            options,
            staged: Mutex::new(Vec::new()),
            unit_open: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            records_affected: AtomicU64::new(0),
        }
    }

    /// Canonical identifier of the engine behind this context
    pub fn engine(&self) -> &'static str {
        self.engine.id()
    }

    pub fn commit_cancellation(&self) -> CommitCancellation {
        self.engine.commit_cancellation()
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the physical connection is currently open
    pub fn is_open(&self) -> bool {
        !self.is_disposed() && self.session.is_open()
    }

    /// Open the physical connection now instead of on first use
    pub async fn open(&self) -> Result<(), DalError> {
        self.ready().await?;
        info!(engine = self.engine(), "Storage context opened");
        Ok(())
    }

    /// Typed read handle over the collection tagged `R::TAG`
    pub fn collection<R: Record>(&self) -> Collection<'_, R> {
        Collection {
            context: self,
            _record: PhantomData,
        }
    }

    /// Flush every staged mutation as one atomic batch
    ///
    /// Fails with `InvalidState` while a unit of work is open; the unit owns
    /// its staged batch and flushes it on commit.
    pub async fn persist_changes(&self) -> Result<u64, DalError> {
        self.ensure_no_open_unit()?;
        self.flush(None).await
    }

    /// Flush staged mutations, stopping early if `cancel` fires
    ///
    /// Whether an in-flight flush stops is decided by the engine's
    /// `CommitCancellation`: abortable engines apply nothing, the others run
    /// the flush to completion and report its real outcome.
    pub async fn persist_changes_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<u64, DalError> {
        self.ensure_no_open_unit()?;
        self.flush(Some(cancel)).await
    }

    /// Verify the engine is reachable
    pub async fn health_check(&self) -> Result<(), DalError> {
        self.ensure_live()?;
        self.bounded("ping", self.session.ping()).await
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            engine: self.engine(),
            opened: self.is_open(),
            flushes: self.flushes.load(Ordering::SeqCst),
            records_affected: self.records_affected.load(Ordering::SeqCst),
            pool: self.session.connection_stats(),
        }
    }

    /// Release the session; every later operation fails with `ContextDisposed`
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let discarded = self.discard_staged();
        if discarded > 0 {
            warn!(
                engine = self.engine(),
                discarded, "Disposing storage context with staged changes"
            );
        }

        self.session.close().await;
        journal::log_context_disposed(
            self.engine(),
            self.flushes.load(Ordering::SeqCst),
            self.records_affected.load(Ordering::SeqCst),
        );
    }

    fn ensure_live(&self) -> Result<(), DalError> {
        if self.is_disposed() {
            return Err(DalError::ContextDisposed {
                engine: self.engine().to_string(),
            });
        }
        Ok(())
    }

    fn ensure_no_open_unit(&self) -> Result<(), DalError> {
        if self.unit_open.load(Ordering::SeqCst) {
            return Err(DalError::invalid_state(format!(
                "a unit of work is open on the '{}' context; commit it instead",
                self.engine()
            )));
        }
        Ok(())
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, DalError>
    where
        F: Future<Output = Result<T, StorageFailure>>,
    {
        match tokio::time::timeout(self.options.command_timeout, call).await {
            Ok(result) => result.map_err(DalError::from),
            Err(_) => Err(StorageFailure::timeout(operation, self.options.command_timeout).into()),
        }
    }

    async fn ready(&self) -> Result<(), DalError> {
        self.ensure_live()?;
        if !self.session.is_open() {
            self.bounded("open", self.session.open()).await?;
        }
        Ok(())
    }

    pub(crate) async fn flush(&self, cancel: Option<&CancellationToken>) -> Result<u64, DalError> {
        self.ensure_live()?;
        let batch = std::mem::take(&mut *self.staged.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(DalError::cancelled("flush"));
        }
        self.ready().await?;

        let started = Instant::now();
        let affected = match self.commit_cancellation() {
            CommitCancellation::AbortOnCancel => {
                let apply = self.bounded("flush", self.session.apply(&batch));
                match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(DalError::cancelled("flush")),
                        result = apply => result?,
                    },
                    None => apply.await?,
                }
            }
            // Bounded by the driver's own timeouts; dropping an in-flight
            // commit here would leave its outcome unknown.
            CommitCancellation::RunToCompletion => self.session.apply(&batch).await?,
        };

        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.records_affected.fetch_add(affected, Ordering::SeqCst);
        telemetry::record_flush(self.engine(), affected);

        let report = FlushReport {
            engine: self.engine(),
            mutations: batch.len(),
            affected,
            elapsed: started.elapsed(),
        };
        debug!(
            engine = report.engine,
            mutations = report.mutations,
            affected = report.affected,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Flushed staged changes"
        );
        if let Some(hook) = &self.options.flush_hook {
            hook(&report);
        }

        Ok(affected)
    }

    pub(crate) fn stage(&self, mutation: Mutation) -> Result<(), DalError> {
        self.ensure_live()?;
        self.staged.lock().push(mutation);
        Ok(())
    }

    pub(crate) fn discard_staged(&self) -> usize {
        let mut staged = self.staged.lock();
        let discarded = staged.len();
        staged.clear();
        discarded
    }

    pub(crate) fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    pub(crate) fn try_claim_unit(&self) -> Result<(), DalError> {
        self.ensure_live()?;
        self.unit_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| {
                DalError::invalid_state(format!(
                    "a unit of work is already open on the '{}' context",
                    self.engine()
                ))
            })
    }

    pub(crate) fn release_unit(&self) {
        self.unit_open.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("engine", &self.engine())
            .field("options", &self.options)
            .field("disposed", &self.is_disposed())
            .field("unit_open", &self.unit_open.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        if !self.is_disposed() && self.session.is_open() {
            warn!(
                engine = self.engine(),
                "Storage context dropped without dispose; releasing session"
            );
        }
    }
}

/// Read handle over one record collection
pub struct Collection<'c, R> {
    context: &'c StorageContext,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Collection<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Collection<'_, R> {}

impl<'c, R: Record> Collection<'c, R> {
    pub fn tag(&self) -> &'static str {
        R::TAG
    }

    /// Fetch one record by key
    pub async fn find(&self, key: &str) -> Result<Option<R>, DalError> {
        self.context.ready().await?;
        let body = self
            .context
            .bounded("fetch", self.context.session.fetch(R::TAG, key))
            .await?;
        body.map(decode).transpose()
    }

    /// All records in key order
    pub async fn all(&self) -> Result<Vec<R>, DalError> {
        self.context.ready().await?;
        let bodies = self
            .context
            .bounded("scan", self.context.session.scan(R::TAG, None))
            .await?;
        bodies.into_iter().map(decode).collect()
    }

    pub async fn count(&self) -> Result<u64, DalError> {
        self.context.ready().await?;
        self.context
            .bounded("count", self.context.session.count(R::TAG))
            .await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, DalError> {
        self.context.ready().await?;
        let body = self
            .context
            .bounded("fetch", self.context.session.fetch(R::TAG, key))
            .await?;
        Ok(body.is_some())
    }

    /// One page of records in key order
    pub async fn page(&self, pagination: Pagination) -> Result<Page<R>, DalError> {
        let total = self.count().await?;
        let bodies = self
            .context
            .bounded(
                "scan",
                self.context.session.scan(R::TAG, Some(&pagination)),
            )
            .await?;
        let items = bodies
            .into_iter()
            .map(decode)
            .collect::<Result<Vec<R>, _>>()?;
        Ok(Page::new(items, &pagination, total))
    }
}
