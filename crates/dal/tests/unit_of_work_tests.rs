//! Unit-of-work lifecycle and atomicity against the memory engine

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{memory_context, Order};
use dal::{
    scoped, ContextFactory, ContextOptions, DalError, ErrorKind, FailureKind, MemoryStore,
    Pagination, Record, UnitOfWork, UnitState,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_commit_applies_staged_mutations() {
    let (store, context) = memory_context("uow-commit");

    let mut unit = UnitOfWork::begin(&context).unwrap();
    let orders = unit.collection::<Order>();
    orders.add(&Order::new("o-1", "ada", 1200)).unwrap();
    orders.add(&Order::new("o-2", "grace", 800)).unwrap();
    assert_eq!(unit.pending(), 2);

    let affected = unit.commit().await.unwrap();
    assert_eq!(affected, 2);
    assert_eq!(unit.state(), UnitState::Committed);
    assert_eq!(store.record_count(Order::TAG), 2);

    let found = context.collection::<Order>().find("o-1").await.unwrap();
    assert_eq!(found, Some(Order::new("o-1", "ada", 1200)));

    context.dispose().await;
}

#[tokio::test]
async fn test_mid_flush_failure_applies_nothing() {
    let (store, context) = memory_context("uow-mid-flush");
    store.fail_flush_after(2, FailureKind::ConnectionReset);

    let mut unit = UnitOfWork::begin(&context).unwrap();
    let orders = unit.collection::<Order>();
    for i in 0..4 {
        orders.add(&Order::new(&format!("o-{i}"), "ada", 100)).unwrap();
    }

    let err = unit.commit().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(err.is_transient());
    assert_eq!(unit.state(), UnitState::RolledBack);
    assert!(store.is_empty());
    assert_eq!(context.collection::<Order>().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_insert_rolls_back_whole_batch() {
    let (store, context) = memory_context("uow-duplicate");

    let mut seed = UnitOfWork::begin(&context).unwrap();
    seed.collection::<Order>()
        .add(&Order::new("o-1", "ada", 100))
        .unwrap();
    seed.commit().await.unwrap();

    let mut unit = UnitOfWork::begin(&context).unwrap();
    let orders = unit.collection::<Order>();
    orders.add(&Order::new("o-2", "grace", 200)).unwrap();
    orders.add(&Order::new("o-1", "ada", 100)).unwrap();

    let err = unit.commit().await.unwrap_err();
    match err {
        DalError::Storage(failure) => {
            assert_eq!(failure.kind(), FailureKind::ConstraintViolation)
        }
        other => panic!("Expected Storage failure, got {other:?}"),
    }
    assert_eq!(store.record_count(Order::TAG), 1);
}

#[tokio::test]
async fn test_closed_unit_rejects_transitions() {
    let (_store, context) = memory_context("uow-closed");

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>()
        .add(&Order::new("o-1", "ada", 100))
        .unwrap();
    unit.commit().await.unwrap();

    assert_eq!(unit.commit().await.unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(unit.rollback().unwrap_err().kind(), ErrorKind::InvalidState);
    let err = unit
        .collection::<Order>()
        .add(&Order::new("o-2", "ada", 100))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let mut aborted = UnitOfWork::begin(&context).unwrap();
    aborted.rollback().unwrap();
    aborted.rollback().unwrap();
    assert_eq!(aborted.state(), UnitState::RolledBack);
    assert_eq!(
        aborted.commit().await.unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[tokio::test]
async fn test_context_flush_is_refused_while_unit_is_open() {
    let (store, context) = memory_context("uow-direct-flush");

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>()
        .add(&Order::new("o-1", "ada", 100))
        .unwrap();

    let err = context.persist_changes().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = context
        .persist_changes_with_cancel(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(unit.state(), UnitState::Open);
    assert_eq!(unit.pending(), 1);
    assert!(store.is_empty());

    assert_eq!(unit.commit().await.unwrap(), 1);
    assert_eq!(context.persist_changes().await.unwrap(), 0);
    assert_eq!(store.record_count(Order::TAG), 1);
}

#[tokio::test]
async fn test_one_open_unit_per_context() {
    let (_store, context) = memory_context("uow-exclusive");

    let first = UnitOfWork::begin(&context).unwrap();
    let err = UnitOfWork::begin(&context).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    drop(first);
    assert!(UnitOfWork::begin(&context).is_ok());
}

#[tokio::test]
async fn test_dropped_unit_discards_staged_changes() {
    let (store, context) = memory_context("uow-drop");

    {
        let unit = UnitOfWork::begin(&context).unwrap();
        unit.collection::<Order>()
            .add(&Order::new("o-1", "ada", 100))
            .unwrap();
    }

    let mut unit = UnitOfWork::begin(&context).unwrap();
    assert_eq!(unit.pending(), 0);
    assert_eq!(unit.commit().await.unwrap(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_update_and_remove() {
    let (store, context) = memory_context("uow-update-remove");

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>()
        .add(&Order::new("o-1", "ada", 100))
        .unwrap();
    unit.commit().await.unwrap();

    let mut unit = UnitOfWork::begin(&context).unwrap();
    let orders = unit.collection::<Order>();
    orders.update(&Order::new("o-1", "ada", 150)).unwrap();
    unit.commit().await.unwrap();
    let stored = context.collection::<Order>().find("o-1").await.unwrap();
    assert_eq!(stored.map(|order| order.total_cents), Some(150));

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>().remove("o-1").unwrap();
    unit.commit().await.unwrap();
    assert!(store.is_empty());

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>().remove("o-1").unwrap();
    let err = unit.commit().await.unwrap_err();
    assert!(matches!(err, DalError::Storage(ref f) if f.kind() == FailureKind::MissingRecord));
}

#[tokio::test]
async fn test_scoped_commits_on_success_and_rolls_back_on_error() {
    let (store, context) = memory_context("uow-scoped");

    let committed = scoped(&context, |unit| {
        Box::pin(async move {
            let orders = unit.collection::<Order>();
            orders.add(&Order::new("o-1", "ada", 100))?;
            orders.add(&Order::new("o-2", "ada", 200))?;
            Ok::<_, DalError>("done")
        })
    })
    .await
    .unwrap();
    assert_eq!(committed.value, "done");
    assert_eq!(committed.affected, 2);

    let err = scoped(&context, |unit| {
        Box::pin(async move {
            unit.collection::<Order>()
                .add(&Order::new("o-3", "ada", 300))?;
            Err::<(), _>(DalError::invalid_state("business rule rejected the order"))
        })
    })
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(store.record_count(Order::TAG), 2);

    // the failed scope released the context
    assert!(UnitOfWork::begin(&context).is_ok());
}

#[tokio::test]
async fn test_disposed_context_rejects_everything() {
    let (store, context) = memory_context("uow-disposed");
    context.open().await.unwrap();
    assert_eq!(store.open_sessions(), 1);

    context.dispose().await;
    context.dispose().await;
    assert_eq!(store.open_sessions(), 0);

    let err = UnitOfWork::begin(&context).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextDisposed);
    let err = context.collection::<Order>().all().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextDisposed);
    assert_eq!(
        context.health_check().await.unwrap_err().kind(),
        ErrorKind::ContextDisposed
    );
}

#[tokio::test]
async fn test_cancelled_commit_on_abortable_engine_applies_nothing() {
    let (store, context) = memory_context("uow-cancel");
    store.set_flush_latency(Some(Duration::from_secs(5)));

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>()
        .add(&Order::new("o-1", "ada", 100))
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = unit.commit_with_cancel(&token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(unit.state(), UnitState::RolledBack);

    store.set_flush_latency(None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_slow_flush_times_out_as_transient() {
    MemoryStore::forget("uow-timeout");
    let store = MemoryStore::named("uow-timeout");
    store.set_flush_latency(Some(Duration::from_millis(500)));

    let options = ContextOptions::new().command_timeout(Duration::from_millis(20));
    let context = ContextFactory::create("memory", "memory:uow-timeout", Some(options)).unwrap();

    let mut unit = UnitOfWork::begin(&context).unwrap();
    unit.collection::<Order>()
        .add(&Order::new("o-1", "ada", 100))
        .unwrap();

    let err = unit.commit().await.unwrap_err();
    match &err {
        DalError::Storage(failure) => assert_eq!(failure.kind(), FailureKind::Timeout),
        other => panic!("Expected timeout, got {other:?}"),
    }
    assert!(err.is_transient());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_flush_hook_and_stats() {
    MemoryStore::forget("uow-hook");
    let seen = Arc::new(AtomicU64::new(0));
    let counter = seen.clone();
    let options = ContextOptions::new().on_flush(move |report| {
        counter.fetch_add(report.affected, Ordering::SeqCst);
    });
    let context = ContextFactory::create("memory", "memory:uow-hook", Some(options)).unwrap();

    let mut unit = UnitOfWork::begin(&context).unwrap();
    let orders = unit.collection::<Order>();
    for i in 0..3 {
        orders.add(&Order::new(&format!("o-{i}"), "ada", 100)).unwrap();
    }
    unit.commit().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    let stats = context.stats();
    assert_eq!(stats.engine, "memory");
    assert!(stats.opened);
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.records_affected, 3);
}

#[tokio::test]
async fn test_collection_reads() {
    let (_store, context) = memory_context("uow-reads");

    let mut unit = UnitOfWork::begin(&context).unwrap();
    let orders = unit.collection::<Order>();
    for i in 0..5 {
        orders.add(&Order::new(&format!("o-{i}"), "ada", i * 10)).unwrap();
    }
    unit.commit().await.unwrap();

    let orders = context.collection::<Order>();
    assert!(orders.contains("o-3").await.unwrap());
    assert!(!orders.contains("o-9").await.unwrap());
    assert_eq!(orders.count().await.unwrap(), 5);

    let all = orders.all().await.unwrap();
    let keys: Vec<_> = all.iter().map(|order| order.id.as_str()).collect();
    assert_eq!(keys, vec!["o-0", "o-1", "o-2", "o-3", "o-4"]);

    let page = orders.page(Pagination::page(2, 2)).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, "o-2");
    assert_eq!(page.total_count, 5);
    assert_eq!(page.total_pages, 3);
    assert!(page.has_next_page());
}
