//! Core types shared across the tidewatch workspace
//!
//! This crate provides the foundational error taxonomy used by the watcher:
//!
//! - **Error handling**: unified [`Error`] type, [`Result`] alias and [`ResultExt`]
//! - **Classification**: [`ErrorClass`] decides whether an error is surfaced
//!

pub mod error;

// Re-export main types for convenience
pub use error::{Error, ErrorClass, Result, ResultExt};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result, ResultExt};
}
