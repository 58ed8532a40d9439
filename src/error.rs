use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the indexing layers.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Database version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Indexing was cancelled")]
    Cancelled,

    #[error("{0}")]
    General(String),
}

pub type IndexResult<T> = Result<T, IndexError>;
