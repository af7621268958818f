#![doc(html_root_url = "https://docs.rs/imagelens/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

//! # ImageLens
//!
//! An image similarity search service. Uploaded images are turned into
//! fixed-length feature vectors by a pretrained convolutional network, stored
//! alongside the original bytes, and retrieved later by nearest-neighbour
//! search against a new query image.
//!
//! ## Features
//!
//! - **Feature Extraction**: ResNet embeddings via libtorch, or a cheap thumbnail extractor
//! - **Vector Storage**: SQLite persistence with an HNSW or exact in-process index
//! - **Similarity Search**: top-K retrieval ranked by cosine similarity
//! - **Web API**: multipart upload and search endpoints plus a feedback form
//!
//! ## Quick Start
//!
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! imagelens = { version = "0.1", features = ["full"] }
//! ```
//!
//! Basic usage:
//! ```rust,no_run
//! use std::sync::Arc;
//! use imagelens::{ImageUpload, MemoryStore, SearchConfig, SimilarityPipeline, ThumbnailExtractor};
//!
//! # async fn run() -> imagelens::Result<()> {
//! let pipeline = SimilarityPipeline::new(
//!     Arc::new(ThumbnailExtractor::default()),
//!     Arc::new(MemoryStore::new()),
//!     SearchConfig::default(),
//! );
//!
//! let bytes = bytes::Bytes::from(std::fs::read("cat.jpg")?);
//! pipeline
//!     .ingest(ImageUpload {
//!         filename: "cat.jpg".into(),
//!         description: "a cat".into(),
//!         topic: "animals".into(),
//!         bytes: bytes.clone(),
//!     })
//!     .await?;
//!
//! let matches = pipeline.search(bytes).await?;
//! println!("best match: {}", matches[0].filename);
//! # Ok(())
//! # }
//! ```

// Internal modules
pub mod api;
pub mod core;
/// Defines the application's error types and result aliases.
pub mod error;
pub mod models;
mod state;
mod utils;

/// Build-time package metadata.
#[allow(dead_code, missing_docs, unreachable_pub)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

// Public API exports
pub use crate::{
    core::embeddings::{ExtractionError, ExtractorKind, FeatureExtractor, ThumbnailExtractor},
    core::pipeline::SimilarityPipeline,
    core::store::{
        FeedbackStore, IndexKind, MemoryStore, SqliteOptions, SqliteStore, StoreError, VectorStore,
    },
    error::{AppError, Result, ResultExt},
    models::{
        feedback::Feedback,
        record::{FeatureVector, ImageRecord, ImageUpload, MatchedImage, NewImageRecord, RecordId, ScoredRecord},
    },
    state::{AppState, Config, SearchConfig, MEMORY_STORE_URL},
};

#[cfg(feature = "web")]
pub use crate::api::{create_router, health_check, HealthResponse};

#[cfg(feature = "embeddings")]
pub use crate::core::embeddings::{Architecture, TchExtractor};

#[cfg(feature = "hnsw")]
pub use crate::core::store::HnswIndex;

/// Initialize the application with default settings
///
/// This function sets up logging. It should be called early in the
/// application startup process, before the configuration is read.
///
/// # Errors
///
/// Returns an error if a global logger is already installed.
///
/// # Example
///
/// ```no_run
/// use imagelens::init;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     init()?;
///     // Application code here
///     Ok(())
/// }
/// ```
pub fn init() -> Result<()> {
    // Initialize logging with sensible defaults
    let env = env_logger::Env::default()
        .default_filter_or("info")
        .default_write_style_or("auto");

    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init()
        .context("initializing logger")?;

    log::info!(
        "Initializing ImageLens {} ({})",
        built_info::PKG_VERSION,
        built_info::BUILT_TIME_UTC
    );
    Ok(())
}
