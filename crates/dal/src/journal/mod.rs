//! Structured logging for the data-access layer
//!
//! Library code only emits `tracing` events. Hosts that have no subscriber of
//! their own can call `init_tracing` once at startup.

pub mod init;
pub mod logging;

pub use init::init_tracing;
pub use logging::*;
