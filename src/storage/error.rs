use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot open store at {path}: {cause}")]
    Open { path: String, cause: String },

    #[error("Store version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt record in {table} for key {key}")]
    CorruptRecord { table: &'static str, key: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
