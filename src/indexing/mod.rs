pub mod indexer;
pub mod job;
pub mod pool;

pub use indexer::Indexer;
pub use job::{IndexerJob, JobOutcome, JobStatus};
pub use pool::JobPool;

/// Seconds since the epoch, for file-information timestamps.
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
