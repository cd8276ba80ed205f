//! Typed errors for the artifact inspection components.
//!
//! Component-level functions (classifier, dependency resolver, path matcher)
//! return [`SensorError`] so callers can tell caller-contract violations apart
//! from expected absence. The orchestration layer wraps these in `anyhow`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for component operations
pub type Result<T> = std::result::Result<T, SensorError>;

/// Errors raised by the classifier, dependency resolver and related helpers
#[derive(Error, Debug)]
pub enum SensorError {
    /// A relative path was passed where an absolute one is required
    #[error("file path is not absolute: {0}")]
    PathNotAbsolute(PathBuf),

    /// Dependency resolution was requested for a non-binary file
    #[error("file is not a binary: {0}")]
    NotBinary(PathBuf),

    /// The external dependency listing tool is not on the search path
    #[error("dependency resolver not found: {0}")]
    ResolverNotFound(String),

    /// The dependency listing tool exited with an unexpected failure
    #[error("dependency resolver failed for {path} (status {status:?}): {stderr}")]
    ResolverFailed {
        /// Binary being inspected
        path: PathBuf,
        /// Exit status, if the process exited normally
        status: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// The file carries the ELF magic but the header cannot be parsed
    #[error("malformed ELF header in {path}: {reason}")]
    MalformedElf {
        /// File being classified
        path: PathBuf,
        /// What was wrong with the header
        reason: String,
    },

    /// A glob pattern could not be translated into a matcher
    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Underlying filesystem or process I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path the operation was applied to
        path: PathBuf,
        /// Original error
        #[source]
        source: io::Error,
    },
}

impl SensorError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SensorError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the non-fatal "tool is missing" condition
    pub fn is_resolver_not_found(&self) -> bool {
        matches!(self, SensorError::ResolverNotFound(_))
    }
}
