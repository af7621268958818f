use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{blocking, Dimension, FeedbackStore, FlatIndex, IndexKind, StoreError, VectorIndex, VectorStore};
use crate::models::feedback::Feedback;
use crate::models::record::{ImageRecord, NewImageRecord, RecordId, ScoredRecord};

/// Keeps every record in process memory. Nothing survives a restart.
pub struct MemoryStore {
    records: RwLock<Vec<ImageRecord>>,
    feedback: RwLock<Vec<Feedback>>,
    index: Arc<dyn VectorIndex>,
    dimension: Dimension,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("index", &self.index)
            .field("dimension", &self.dimension.get())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_index(Arc::new(FlatIndex::default()))
    }
}

impl MemoryStore {
    /// Creates an empty store searched by exact scan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store searched through the given index.
    pub fn with_index(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            feedback: RwLock::new(Vec::new()),
            index,
            dimension: Dimension::default(),
        }
    }

    /// Creates an empty store with an index of the given kind.
    pub fn with_index_kind(kind: IndexKind, max_elements: usize) -> Self {
        Self::with_index(kind.build(max_elements))
    }

    /// Snapshot of every stored record, in insertion order.
    pub fn records(&self) -> Vec<ImageRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Snapshot of every feedback submission, in arrival order.
    pub fn feedback(&self) -> Vec<Feedback> {
        self.feedback.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn ingest(&self, record: NewImageRecord) -> Result<RecordId, StoreError> {
        let id = RecordId::generate();
        let features = record.features.clone();
        let seq = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            self.dimension.check(features.len())?;
            let seq = records.len();
            records.push(ImageRecord::from_new(id.clone(), record));
            self.dimension.commit(features.len())?;
            seq
        };

        let index = Arc::clone(&self.index);
        blocking(move || index.insert(seq, &features)).await?;
        Ok(id)
    }

    async fn nearest_neighbors(
        &self,
        query: &[f32],
        k: usize,
        candidate_pool: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        self.dimension.check(query.len())?;

        let index = Arc::clone(&self.index);
        let query = query.to_vec();
        let neighbors = blocking(move || index.search(&query, k, candidate_pool.max(k))).await?;
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(neighbors
            .into_iter()
            .filter_map(|n| {
                records.get(n.seq).map(|record| ScoredRecord { record: record.clone(), score: n.score })
            })
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).len() as u64)
    }
}

#[async_trait]
impl FeedbackStore for MemoryStore {
    async fn submit_feedback(&self, feedback: Feedback) -> Result<(), StoreError> {
        self.feedback.write().unwrap_or_else(|e| e.into_inner()).push(feedback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(name: &str, features: Vec<f32>) -> NewImageRecord {
        NewImageRecord {
            features,
            filename: name.to_string(),
            description: format!("{} description", name),
            topic: "test".to_string(),
            image: Bytes::from_static(b"\x89PNG"),
        }
    }

    #[tokio::test]
    async fn test_empty_store_returns_no_neighbors() {
        let store = MemoryStore::new();
        let hits = store.nearest_neighbors(&[1.0, 2.0, 3.0], 5, 10).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_self_query_ranks_first() {
        let store = MemoryStore::new();
        store.ingest(record("a.png", vec![1.0, 0.0, 0.0])).await.unwrap();
        let id = store.ingest(record("b.png", vec![0.2, 0.9, 0.1])).await.unwrap();
        store.ingest(record("c.png", vec![0.0, 0.0, 1.0])).await.unwrap();

        let hits = store.nearest_neighbors(&[0.2, 0.9, 0.1], 3, 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].record.id, id);
        assert_eq!(hits[0].record.filename, "b.png");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_duplicates_are_kept() {
        let store = MemoryStore::new();
        let first = store.ingest(record("same.png", vec![1.0, 1.0])).await.unwrap();
        let second = store.ingest(record("same.png", vec![1.0, 1.0])).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.count().await.unwrap(), 2);

        let hits = store.nearest_neighbors(&[1.0, 1.0], 2, 2).await.unwrap();
        assert_eq!(hits[0].record.id, first);
        assert_eq!(hits[1].record.id, second);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let store = MemoryStore::new();
        store.ingest(record("a.png", vec![1.0, 0.0])).await.unwrap();

        let err = store.ingest(record("b.png", vec![1.0, 0.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, StoreError::Dimension { expected: 2, actual: 3 }));

        let err = store.nearest_neighbors(&[1.0], 1, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Dimension { .. }));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_k_returns_nothing() {
        let store = MemoryStore::new();
        store.ingest(record("a.png", vec![1.0, 0.0])).await.unwrap();
        assert!(store.nearest_neighbors(&[1.0, 0.0], 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feedback_is_recorded() {
        let store = MemoryStore::new();
        store.submit_feedback(Feedback::new("5", None)).await.unwrap();
        let feedback = store.feedback();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].rate, "5");
        assert_eq!(feedback[0].comment, "");
    }
}
