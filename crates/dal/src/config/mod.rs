//! # Configuration
//!
//! Database configuration bound into a container, plus the runtime options
//! the context factory applies over engine defaults.

pub mod options;
pub mod types;

// Re-export commonly used types
pub use options::*;
pub use types::*;
