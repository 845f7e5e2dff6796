//! Core types and utilities for plant disease classifier training.
//!
//! This crate provides the error taxonomy, the shared data model (class
//! catalog, sample records, splits), run configuration and metric history
//! used across the workspace.

pub mod error;
pub mod types;
pub mod config;
pub mod metrics;
pub mod cli;

pub use error::{Error, Result};
pub use types::*;
pub use config::*;
pub use metrics::*;
pub use cli::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::types::*;
    pub use crate::config::*;
    pub use crate::metrics::*;
    pub use crate::cli::*;
}
