use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use log::{debug, info};

use crate::core::embeddings::{extract_blocking, FeatureExtractor};
use crate::core::store::{StoreError, VectorStore};
use crate::error::Result;
use crate::models::record::{FeatureVector, ImageUpload, MatchedImage, NewImageRecord, RecordId};
use crate::state::SearchConfig;
use crate::utils::image_mime_type;

/// Orchestrates extraction and storage for ingest, and extraction, query and
/// result shaping for search.
///
/// Stateless apart from the two shared services it holds; construct once and
/// share behind an `Arc`.
pub struct SimilarityPipeline {
    extractor: Arc<dyn FeatureExtractor>,
    store: Arc<dyn VectorStore>,
    options: SearchConfig,
}

impl fmt::Debug for SimilarityPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimilarityPipeline")
            .field("extractor", &self.extractor)
            .field("options", &self.options)
            .finish()
    }
}

async fn bounded<T, F>(timeout: Duration, operation: F) -> std::result::Result<T, StoreError>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

impl SimilarityPipeline {
    /// Creates a pipeline over the given extractor and store.
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        store: Arc<dyn VectorStore>,
        options: SearchConfig,
    ) -> Self {
        Self { extractor, store, options }
    }

    /// The search and timeout settings in use.
    pub fn options(&self) -> &SearchConfig {
        &self.options
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Decodes an encoded image and extracts its feature vector off the
    /// async runtime.
    pub async fn extract(&self, bytes: Bytes) -> Result<FeatureVector> {
        let features =
            extract_blocking(Arc::clone(&self.extractor), bytes, self.options.extract_timeout).await?;
        Ok(features)
    }

    /// Extracts the upload's features and persists it.
    ///
    /// The store is only written once extraction has succeeded, so a failed
    /// ingest leaves no record behind.
    pub async fn ingest(&self, upload: ImageUpload) -> Result<RecordId> {
        let features = self.extract(upload.bytes.clone()).await?;

        info!(
            "Storing image {:?} (topic {:?}, description {:?}, {} bytes, {} features)",
            upload.filename,
            upload.topic,
            upload.description,
            upload.bytes.len(),
            features.len()
        );

        let record = NewImageRecord {
            features,
            filename: upload.filename,
            description: upload.description,
            topic: upload.topic,
            image: upload.bytes,
        };
        // Runs to completion even if this request is dropped, so a stored row
        // is always indexed. Storage backends bound their own waits.
        let store = Arc::clone(&self.store);
        let id = tokio::spawn(async move { store.ingest(record).await })
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        debug!("Stored image as {}", id);
        Ok(id)
    }

    /// Finds the stored images most similar to the query image, best first.
    ///
    /// An empty list means nothing matched.
    pub async fn search(&self, bytes: Bytes) -> Result<Vec<MatchedImage>> {
        let query = self.extract(bytes).await?;

        let hits = bounded(
            self.options.store_timeout,
            self.store
                .nearest_neighbors(&query, self.options.top_k, self.options.num_candidates),
        )
        .await?;

        debug!("Search matched {} images", hits.len());
        let engine = base64::engine::general_purpose::STANDARD;
        Ok(hits
            .into_iter()
            .map(|hit| {
                debug!("{} scored {:.4}", hit.record.filename, hit.score);
                MatchedImage {
                    mime_type: image_mime_type(&hit.record.filename, &hit.record.image),
                    filename: hit.record.filename,
                    topic: hit.record.topic,
                    description: hit.record.description,
                    image: engine.encode(&hit.record.image),
                }
            })
            .collect())
    }
}
