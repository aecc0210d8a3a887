//! Structured logging functions

use std::time::Duration;

use tracing::{info, warn};

use crate::error::StorageFailure;

/// Log a committed unit of work
pub fn log_unit_committed(engine: &str, mutations: usize, affected: u64) {
    info!(
        engine = %engine,
        mutations = mutations,
        affected = affected,
        "Unit of work committed"
    );
}

/// Log a rolled back unit of work
pub fn log_unit_rolled_back(engine: &str, discarded: usize, reason: &str) {
    info!(
        engine = %engine,
        discarded = discarded,
        reason = %reason,
        "Unit of work rolled back"
    );
}

/// Log a transient failure that will be retried
pub fn log_retry_attempt(attempt: u32, max_attempts: u32, delay: Duration, failure: &StorageFailure) {
    warn!(
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay.as_millis() as u64,
        kind = %failure.kind(),
        error = %failure,
        "Transient storage failure, retrying"
    );
}

/// Log a logical operation that ran out of attempts
pub fn log_retry_exhausted(attempts: u32, failure: &StorageFailure) {
    warn!(
        attempts = attempts,
        kind = %failure.kind(),
        error = %failure,
        "Retry attempts exhausted"
    );
}

/// Log context disposal
pub fn log_context_disposed(engine: &str, flushes: u64, records_affected: u64) {
    info!(
        engine = %engine,
        flushes = flushes,
        records_affected = records_affected,
        "Storage context disposed"
    );
}
