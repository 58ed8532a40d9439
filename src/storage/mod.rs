mod error;
mod store;

pub use error::{StorageError, StorageResult};
pub use store::{Store, Table, WriteBatch};
