//! Collaborator stores: per-file read offsets and aggregated query statistics.

pub mod positions;
pub mod stats;

use std::io;
use std::path::Path;
use std::time::Duration;

pub use positions::{FilePositionStore, MemoryPositionStore};
pub use stats::{MemoryStatsStore, QueryStats, SortField};

/// Error returned by a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("encode: {0}")]
    Encode(String),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Persists per-file read offsets so a restart resumes instead of replaying.
pub trait PositionStore: Send + Sync {
    /// Last saved offset for `path`, 0 if unknown.
    fn get_position(&self, path: &Path) -> Result<u64, StoreError>;

    fn save_position(&self, path: &Path, offset: u64) -> Result<(), StoreError>;

    /// Forgets every saved offset so the next run re-reads all files.
    fn reset(&self) -> Result<(), StoreError>;
}

/// Aggregated per-fingerprint statistics.
pub trait StatsStore: Send + Sync {
    /// Adds one execution to the aggregate for `fingerprint`, creating it if
    /// needed. `sample_params` replaces the stored sample only when present.
    fn upsert(
        &self,
        fingerprint: u64,
        normalized_query: &str,
        duration_ms: f64,
        rows: i64,
        sample_params: Option<String>,
    ) -> Result<(), StoreError>;

    /// Deletes aggregates not seen within `retention`. Returns rows deleted.
    fn cleanup(&self, retention: Duration) -> Result<usize, StoreError>;
}
