//! Core functionality: feature extraction, vector storage and similarity search

/// Turns decoded images into fixed-length feature vectors.
pub mod embeddings;
/// Ingest and search flows over an extractor and a store.
pub mod pipeline;
/// Persists image records and runs nearest-neighbour queries.
pub mod store;
