pub mod types;
pub mod symbol;
pub mod intern;
pub mod storage;
pub mod sync;
pub mod parsing;
pub mod indexing;
pub mod project;
pub mod server;
pub mod config;
pub mod error;
pub mod logging;

pub use types::*;
pub use symbol::{CursorInfo, FileInformation};
pub use intern::LocationInterner;
pub use storage::{Store, Table, WriteBatch};
pub use sync::Syncer;
pub use parsing::{CParser, Frontend, ParsedUnit};
pub use indexing::{Indexer, IndexerJob, JobPool};
pub use project::Project;
pub use config::Settings;
pub use error::{IndexError, IndexResult};

/// Version tag written ahead of every serialized blob and store value.
/// Readers refuse data tagged with a different value; there are no
/// in-process migrations.
pub const DATABASE_VERSION: u32 = 3;
