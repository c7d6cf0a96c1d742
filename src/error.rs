//! Error types for the partitioning and preprocessing pipeline.
//!
//! Structural problems (missing columns, bad configuration) are fatal and
//! raised synchronously at `fit`/`split` entry. Data sparsity (missing
//! per-patient files, empty variables inside the observation window) is
//! never an error at this level; it degrades to NaN and is surfaced only
//! through diagnostic logging.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all pipeline components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A configured column is absent from the input table.
    #[error("schema error: {0}")]
    Schema(String),

    /// The data cannot support the requested operation (class too small,
    /// conflicting duplicate labels, empty input).
    #[error("data error: {0}")]
    Data(String),

    /// A constructor or split parameter is out of its valid range.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A fold generator post-condition failed. Indicates a bug, not
    /// caller misuse.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Component used before `fit`.
    #[error("{0} must be fitted before transform")]
    NotFitted(&'static str),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl PipelineError {
    pub fn schema(msg: impl Into<String>) -> Self {
        PipelineError::Schema(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        PipelineError::Data(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        PipelineError::Invariant(msg.into())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, PipelineError>;
