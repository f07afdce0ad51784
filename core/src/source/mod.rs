//! Record sources: lazy, restartable, window-filtered record streams.
//!
//! RULE: every source yields records in `[start, end)` ordered by
//! (timestamp, id) ascending. Downstream group rules rely on it.
//! Each call to `open` starts a fresh stream; the stream owns its
//! connection or file handle and releases it when dropped.

use std::path::PathBuf;

use crate::{
    config::SourceConfig,
    error::FraudResult,
    record::Record,
    window::TimeWindow,
};

pub mod jsonl;
pub mod sqlite;

pub use jsonl::JsonlRecordSource;
pub use sqlite::SqliteRecordSource;

/// A boxed record stream. Errors are fatal to the run.
pub type RecordStream = Box<dyn Iterator<Item = FraudResult<Record>> + Send>;

pub trait RecordSource: Send + Sync {
    /// Short description for logs and summaries.
    fn describe(&self) -> String;

    /// Start a new pass over the records in `window`. Connectivity
    /// problems surface here, before any record is yielded.
    fn open(&self, window: &TimeWindow) -> FraudResult<RecordStream>;
}

/// Build the configured source.
pub fn from_config(config: &SourceConfig) -> Box<dyn RecordSource> {
    match config {
        SourceConfig::Sqlite { path, page_size } => {
            Box::new(SqliteRecordSource::new(path.clone(), *page_size))
        }
        SourceConfig::Jsonl { path } => Box::new(JsonlRecordSource::new(PathBuf::from(path))),
    }
}
