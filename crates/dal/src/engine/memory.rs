//! In-process storage engine.
//!
//! Stores live in a process-wide registry keyed by store name, so every
//! context created for `memory:<name>` sees the same records. A store tracks
//! how many sessions hold it open and accepts injected faults, which makes it
//! the engine of choice for exercising unit-of-work and retry behaviour.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use super::traits::{CommitCancellation, Mutation, MutationOp, StorageEngine, StorageSession};
use crate::config::{EngineDefaults, ResolvedOptions};
use crate::error::{DalError, FailureKind, StorageFailure};
use crate::pagination::Pagination;

static STORES: OnceLock<Mutex<HashMap<String, Arc<MemoryStore>>>> = OnceLock::new();

fn stores() -> &'static Mutex<HashMap<String, Arc<MemoryStore>>> {
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

type RecordKey = (String, String);

/// Engine backed by named in-process stores
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryEngine;

impl MemoryEngine {
    /// Extract the store name from `memory:<name>` or `memory://<name>`
    pub fn store_name(descriptor: &str) -> Result<&str, DalError> {
        let descriptor = descriptor.trim();
        let name = descriptor
            .strip_prefix("memory://")
            .or_else(|| descriptor.strip_prefix("memory:"))
            .ok_or_else(|| {
                DalError::invalid_config(
                    "connection",
                    descriptor,
                    "Memory descriptors look like memory:<name>",
                )
            })?;

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(DalError::invalid_config(
                "connection",
                descriptor,
                "Store name must be non-empty and use only letters, digits, '-', '_' or '.'",
            ));
        }

        Ok(name)
    }
}

impl StorageEngine for MemoryEngine {
    fn id(&self) -> &'static str {
        "memory"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["in-memory"]
    }

    fn defaults(&self) -> EngineDefaults {
        EngineDefaults {
            max_pool_size: 1,
            lazy_connect: true,
        }
    }

    fn commit_cancellation(&self) -> CommitCancellation {
        CommitCancellation::AbortOnCancel
    }

    fn validate_descriptor(&self, descriptor: &str) -> Result<(), DalError> {
        Self::store_name(descriptor).map(|_| ())
    }

    fn connect(
        &self,
        descriptor: &str,
        _options: &ResolvedOptions,
    ) -> Result<Box<dyn StorageSession>, DalError> {
        let store = MemoryStore::named(Self::store_name(descriptor)?);
        Ok(Box::new(MemorySession::new(store)))
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    open_failures: VecDeque<FailureKind>,
    flush_failures: VecDeque<FailureKind>,
    mid_flush: Option<(usize, FailureKind)>,
    flush_latency: Option<Duration>,
}

/// Named in-process record store
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    records: RwLock<BTreeMap<RecordKey, Value>>,
    faults: Mutex<FaultPlan>,
    open_sessions: AtomicUsize,
    opened_total: AtomicU64,
    closed_total: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(FaultPlan::default()),
            open_sessions: AtomicUsize::new(0),
            opened_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Get the store registered under `name`, creating it on first use
    pub fn named(name: &str) -> Arc<MemoryStore> {
        stores()
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(name)))
            .clone()
    }

    /// Drop `name` from the registry; live sessions keep their handle
    pub fn forget(name: &str) -> bool {
        stores().lock().remove(name).is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sessions currently holding the store open
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::SeqCst)
    }

    pub fn closed_total(&self) -> u64 {
        self.closed_total.load(Ordering::SeqCst)
    }

    /// Successful flushes applied to this store
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Total records across all collections
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records stored under one tag
    pub fn record_count(&self, tag: &str) -> usize {
        self.records
            .read()
            .keys()
            .filter(|(record_tag, _)| record_tag == tag)
            .count()
    }

    /// Remove every record and clear pending faults
    pub fn reset(&self) {
        self.records.write().clear();
        *self.faults.lock() = FaultPlan::default();
    }

    /// Fail the next `times` connection opens with `kind`
    pub fn fail_next_opens(&self, kind: FailureKind, times: usize) {
        self.faults
            .lock()
            .open_failures
            .extend(std::iter::repeat(kind).take(times));
    }

    /// Fail the next `times` flushes with `kind` before anything is applied
    pub fn fail_next_flushes(&self, kind: FailureKind, times: usize) {
        self.faults
            .lock()
            .flush_failures
            .extend(std::iter::repeat(kind).take(times));
    }

    /// Fail the next flush after `applied` mutations have been applied
    pub fn fail_flush_after(&self, applied: usize, kind: FailureKind) {
        self.faults.lock().mid_flush = Some((applied, kind));
    }

    /// Delay every flush by `latency` before it is applied
    pub fn set_flush_latency(&self, latency: Option<Duration>) {
        self.faults.lock().flush_latency = latency;
    }

    fn injected(&self, kind: FailureKind, phase: &str) -> StorageFailure {
        StorageFailure::new(
            kind,
            format!("injected {phase} failure on memory store '{}'", self.name),
        )
    }

    fn apply_batch(&self, batch: &[Mutation]) -> Result<u64, StorageFailure> {
        let mid_flush = self.faults.lock().mid_flush.take();

        let mut records = self.records.write();
        let mut staged = records.clone();

        for (index, mutation) in batch.iter().enumerate() {
            if let Some((after, kind)) = mid_flush {
                if index == after {
                    return Err(self.injected(kind, "mid-flush"));
                }
            }

            let key = (mutation.tag.clone(), mutation.key.clone());
            match &mutation.op {
                MutationOp::Insert(body) => {
                    if staged.contains_key(&key) {
                        return Err(StorageFailure::new(
                            FailureKind::ConstraintViolation,
                            format!("duplicate key '{}' in '{}'", mutation.key, mutation.tag),
                        ));
                    }
                    staged.insert(key, body.clone());
                }
                MutationOp::Update(body) => match staged.get_mut(&key) {
                    Some(existing) => *existing = body.clone(),
                    None => return Err(missing(mutation)),
                },
                MutationOp::Delete => {
                    if staged.remove(&key).is_none() {
                        return Err(missing(mutation));
                    }
                }
            }
        }

        *records = staged;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(batch.len() as u64)
    }
}

fn missing(mutation: &Mutation) -> StorageFailure {
    StorageFailure::new(
        FailureKind::MissingRecord,
        format!(
            "cannot {} missing record '{}' in '{}'",
            mutation.verb(),
            mutation.key,
            mutation.tag
        ),
    )
}

/// Session over one memory store
pub struct MemorySession {
    store: Arc<MemoryStore>,
    open: AtomicBool,
}

impl MemorySession {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            open: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.store.open_sessions.fetch_sub(1, Ordering::SeqCst);
            self.store.closed_total.fetch_add(1, Ordering::SeqCst);
            debug!(store = %self.store.name, "Memory session released");
        }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn open(&self) -> Result<(), StorageFailure> {
        if self.open.load(Ordering::SeqCst) {
            return Ok(());
        }

        let fault = self.store.faults.lock().open_failures.pop_front();
        if let Some(kind) = fault {
            return Err(self.store.injected(kind, "open"));
        }

        if !self.open.swap(true, Ordering::SeqCst) {
            self.store.open_sessions.fetch_add(1, Ordering::SeqCst);
            self.store.opened_total.fetch_add(1, Ordering::SeqCst);
            debug!(store = %self.store.name, "Memory session opened");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn fetch(&self, tag: &str, key: &str) -> Result<Option<Value>, StorageFailure> {
        let records = self.store.records.read();
        Ok(records.get(&(tag.to_string(), key.to_string())).cloned())
    }

    async fn scan(
        &self,
        tag: &str,
        window: Option<&Pagination>,
    ) -> Result<Vec<Value>, StorageFailure> {
        let records = self.store.records.read();
        let matching = records
            .range((tag.to_string(), String::new())..)
            .take_while(|((record_tag, _), _)| record_tag == tag)
            .map(|(_, body)| body.clone());

        Ok(match window {
            Some(window) => matching
                .skip(window.offset as usize)
                .take(window.limit as usize)
                .collect(),
            None => matching.collect(),
        })
    }

    async fn count(&self, tag: &str) -> Result<u64, StorageFailure> {
        Ok(self.store.record_count(tag) as u64)
    }

    async fn apply(&self, batch: &[Mutation]) -> Result<u64, StorageFailure> {
        let latency = self.store.faults.lock().flush_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let fault = self.store.faults.lock().flush_failures.pop_front();
        if let Some(kind) = fault {
            return Err(self.store.injected(kind, "flush"));
        }

        self.store.apply_batch(batch)
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(name: &str) -> (Arc<MemoryStore>, MemorySession) {
        MemoryStore::forget(name);
        let store = MemoryStore::named(name);
        (store.clone(), MemorySession::new(store))
    }

    #[test]
    fn test_store_name_parsing() {
        assert_eq!(MemoryEngine::store_name("memory:orders").unwrap(), "orders");
        assert_eq!(MemoryEngine::store_name("memory://orders-2").unwrap(), "orders-2");
        assert!(MemoryEngine::store_name("memory:").is_err());
        assert!(MemoryEngine::store_name("memory:with space").is_err());
        assert!(MemoryEngine::store_name("orders").is_err());
    }

    #[tokio::test]
    async fn test_open_close_tracking() {
        let (store, session) = session("memory-unit-open-close");
        assert_eq!(store.open_sessions(), 0);

        session.open().await.unwrap();
        session.open().await.unwrap();
        assert_eq!(store.open_sessions(), 1);
        assert_eq!(store.opened_total(), 1);

        session.close().await;
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.closed_total(), 1);

        session.open().await.unwrap();
        drop(session);
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.closed_total(), 2);
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let (store, session) = session("memory-unit-atomic");
        session.open().await.unwrap();

        let batch = vec![
            Mutation::insert("user", "a", json!({"id": "a"})),
            Mutation::insert("user", "b", json!({"id": "b"})),
            Mutation::insert("user", "a", json!({"id": "a"})),
        ];
        let err = session.apply(&batch).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConstraintViolation);
        assert!(store.is_empty());

        assert_eq!(session.apply(&batch[..2]).await.unwrap(), 2);
        assert_eq!(store.record_count("user"), 2);
    }

    #[tokio::test]
    async fn test_update_and_delete_require_existing_record() {
        let (store, session) = session("memory-unit-missing");

        let err = session
            .apply(&[Mutation::update("user", "ghost", json!({}))])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::MissingRecord);

        let err = session
            .apply(&[Mutation::delete("user", "ghost")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::MissingRecord);
        assert_eq!(store.flushes(), 0);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let (store, session) = session("memory-unit-faults");
        store.fail_next_opens(FailureKind::ConnectionReset, 1);
        store.fail_next_flushes(FailureKind::Deadlock, 1);

        assert_eq!(
            session.open().await.unwrap_err().kind(),
            FailureKind::ConnectionReset
        );
        session.open().await.unwrap();

        let batch = [Mutation::insert("user", "a", json!({"id": "a"}))];
        assert_eq!(
            session.apply(&batch).await.unwrap_err().kind(),
            FailureKind::Deadlock
        );
        assert_eq!(session.apply(&batch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_is_ordered_and_windowed() {
        let (_store, session) = session("memory-unit-scan");
        let batch: Vec<_> = ["c", "a", "b"]
            .iter()
            .map(|key| Mutation::insert("item", *key, json!({ "id": key })))
            .chain(std::iter::once(Mutation::insert("other", "z", json!({}))))
            .collect();
        session.apply(&batch).await.unwrap();

        let all = session.scan("item", None).await.unwrap();
        assert_eq!(all, vec![json!({"id": "a"}), json!({"id": "b"}), json!({"id": "c"})]);

        let window = Pagination::new(1, 1);
        let page = session.scan("item", Some(&window)).await.unwrap();
        assert_eq!(page, vec![json!({"id": "b"})]);
        assert_eq!(session.count("item").await.unwrap(), 3);
    }
}
