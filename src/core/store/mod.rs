//! Vector store adapter: persistence of image records and similarity queries

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::feedback::Feedback;
use crate::models::record::{NewImageRecord, RecordId, ScoredRecord};

/// Swappable nearest-neighbour indexes.
pub mod index;
/// Non-durable in-process store.
pub mod memory;
/// Durable SQLite store.
pub mod sqlite;

pub use self::index::{FlatIndex, IndexKind, Neighbor, VectorIndex};
pub use self::memory::MemoryStore;
pub use self::sqlite::{SqliteOptions, SqliteStore};

#[cfg(feature = "hnsw")]
pub use self::index::HnswIndex;

/// Errors that can occur during vector store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or opened.
    #[error("failed to connect to store")]
    Connection(#[source] sqlx::Error),

    /// Applying the schema failed.
    #[error("failed to migrate store schema")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A read failed.
    #[error("store query failed")]
    Query(#[source] sqlx::Error),

    /// A write failed.
    #[error("store insert failed")]
    Insert(#[source] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt record {id}: {reason}")]
    Corrupt {
        /// Identifier of the offending row.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A vector does not have the length every record in the store has.
    #[error("vector has {actual} dimensions, store holds {expected}")]
    Dimension {
        /// Length fixed by the store.
        expected: usize,
        /// Length supplied.
        actual: usize,
    },

    /// The operation did not finish in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The worker running the operation failed.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Persists image records and answers nearest-neighbour queries over them.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts a record and returns the identifier the store assigned.
    ///
    /// No deduplication is performed.
    async fn ingest(&self, record: NewImageRecord) -> Result<RecordId, StoreError>;

    /// Returns up to `k` records ranked by descending cosine similarity to
    /// `query`, ties broken by insertion order.
    ///
    /// `candidate_pool` bounds how many candidates an approximate index
    /// considers; it is raised to `k` when smaller. An empty store yields an
    /// empty list.
    async fn nearest_neighbors(
        &self,
        query: &[f32],
        k: usize,
        candidate_pool: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError>;

    /// Number of stored records.
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Persists satisfaction survey submissions.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Stores one submission.
    async fn submit_feedback(&self, feedback: Feedback) -> Result<(), StoreError>;
}

/// Tracks the vector length shared by every record of a store.
///
/// The first vector actually stored fixes it: writers [`check`](Self::check)
/// before writing and [`commit`](Self::commit) once the write succeeded.
#[derive(Debug, Default)]
pub(crate) struct Dimension(OnceLock<usize>);

impl Dimension {
    pub(crate) fn fixed(len: usize) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(len);
        Self(cell)
    }

    /// Checks `len` against the dimension; always passes while unset.
    pub(crate) fn check(&self, len: usize) -> Result<(), StoreError> {
        match self.0.get() {
            Some(&expected) => Self::compare(expected, len),
            None => Ok(()),
        }
    }

    /// Fixes the dimension to `len` if unset, otherwise checks against it.
    pub(crate) fn commit(&self, len: usize) -> Result<(), StoreError> {
        let expected = *self.0.get_or_init(|| len);
        Self::compare(expected, len)
    }

    pub(crate) fn get(&self) -> Option<usize> {
        self.0.get().copied()
    }

    fn compare(expected: usize, actual: usize) -> Result<(), StoreError> {
        if expected == actual {
            Ok(())
        } else {
            Err(StoreError::Dimension { expected, actual })
        }
    }
}

/// Runs CPU-bound index work on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_fixed_by_first_commit() {
        let dimension = Dimension::default();
        assert!(dimension.check(3).is_ok());
        assert!(dimension.check(4).is_ok());
        assert_eq!(dimension.get(), None);

        assert!(dimension.commit(4).is_ok());
        assert_eq!(dimension.get(), Some(4));
        assert!(matches!(
            dimension.check(3),
            Err(StoreError::Dimension { expected: 4, actual: 3 })
        ));
        assert!(dimension.commit(3).is_err());
    }

    #[test]
    fn test_dimension_fixed_up_front() {
        let dimension = Dimension::fixed(2);
        assert!(dimension.check(2).is_ok());
        assert!(dimension.commit(5).is_err());
    }
}
