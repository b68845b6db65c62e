use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Core error type for Ensemble.
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key/value store error: {0}")]
    Kvs(String),
    #[error("failed to decode stored payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed pattern manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },
    #[error("node {0} is not present in the catalog")]
    NodeNotRegistered(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EnsembleError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn kvs(reason: impl Into<String>) -> Self {
        Self::Kvs(reason.into())
    }

    pub fn manifest(path: PathBuf, reason: impl fmt::Display) -> Self {
        Self::Manifest {
            path,
            reason: reason.to_string(),
        }
    }
}

/// Failure of a single operation inside a task.
///
/// Operation failures are recorded in the journal rather than propagated out
/// of the scheduler tick, so they carry enough detail to be rendered later.
#[derive(Debug, Clone)]
pub struct OperationError {
    pub operation: String,
    pub reason: String,
    pub exit_code: Option<i32>,
}

impl OperationError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(
                f,
                "operation {} failed with exit status {}: {}",
                self.operation, code, self.reason
            ),
            None => write!(f, "operation {} failed: {}", self.operation, self.reason),
        }
    }
}

impl std::error::Error for OperationError {}
