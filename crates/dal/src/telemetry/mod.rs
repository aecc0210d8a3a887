//! # Data-Access Metrics
//!
//! Counters emitted through the `metrics` facade. They are no-ops until the
//! hosting service installs a recorder.

pub mod labels;

use metrics::{counter, describe_counter};

use crate::error::FailureKind;
use labels::{values, ENGINE_LABEL, KIND_LABEL, OUTCOME_LABEL};

pub const UNITS_TOTAL: &str = "dal_units_total";
pub const RECORDS_AFFECTED_TOTAL: &str = "dal_records_affected_total";
pub const RETRY_ATTEMPTS_TOTAL: &str = "dal_retry_attempts_total";
pub const RETRY_EXHAUSTED_TOTAL: &str = "dal_retry_exhausted_total";

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(UNITS_TOTAL, "Units of work closed, by engine and outcome");
    describe_counter!(
        RECORDS_AFFECTED_TOTAL,
        "Records affected by successful flushes"
    );
    describe_counter!(
        RETRY_ATTEMPTS_TOTAL,
        "Attempts that failed transiently and were retried"
    );
    describe_counter!(
        RETRY_EXHAUSTED_TOTAL,
        "Operations that exhausted every retry attempt"
    );
}

pub(crate) fn record_unit_committed(engine: &'static str) {
    counter!(UNITS_TOTAL, ENGINE_LABEL => engine, OUTCOME_LABEL => values::OUTCOME_COMMITTED)
        .increment(1);
}

pub(crate) fn record_unit_rolled_back(engine: &'static str) {
    counter!(UNITS_TOTAL, ENGINE_LABEL => engine, OUTCOME_LABEL => values::OUTCOME_ROLLED_BACK)
        .increment(1);
}

pub(crate) fn record_flush(engine: &'static str, affected: u64) {
    counter!(RECORDS_AFFECTED_TOTAL, ENGINE_LABEL => engine).increment(affected);
}

pub(crate) fn record_retry_attempt(kind: FailureKind) {
    counter!(RETRY_ATTEMPTS_TOTAL, KIND_LABEL => kind.as_str()).increment(1);
}

pub(crate) fn record_retry_exhausted() {
    counter!(RETRY_EXHAUSTED_TOTAL).increment(1);
}
