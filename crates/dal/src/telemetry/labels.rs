//! # Standardized Metric Labels
//!
//! Label keys and values shared by all data-access metrics.

/// Engine label key, the canonical engine identifier
pub const ENGINE_LABEL: &str = "engine";

/// Outcome label key for unit-of-work results
pub const OUTCOME_LABEL: &str = "outcome";

/// Failure kind label key for retried failures
pub const KIND_LABEL: &str = "kind";

/// Common label values
pub mod values {
    pub const OUTCOME_COMMITTED: &str = "committed";
    pub const OUTCOME_ROLLED_BACK: &str = "rolled_back";
}
