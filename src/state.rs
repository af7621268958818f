use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::embeddings::{build_extractor, ExtractorKind, FeatureExtractor};
use crate::core::pipeline::SimilarityPipeline;
use crate::core::store::{FeedbackStore, IndexKind, MemoryStore, SqliteOptions, SqliteStore, VectorStore};
use crate::error::{AppError, Result};

/// `DATABASE_URL` value selecting the non-durable in-process store.
pub const MEMORY_STORE_URL: &str = "memory";

/// Configuration for the application
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind_addr: SocketAddr,
    /// Store connection string, or [`MEMORY_STORE_URL`]
    pub database_url: String,
    /// Maximum request body size in bytes
    pub max_upload_size: usize,
    /// Which feature extractor to run
    pub extractor: ExtractorKind,
    /// Network weights for the resnet extractors
    pub model_weights: Option<PathBuf>,
    /// Nearest-neighbour index built by the store
    pub vector_index: IndexKind,
    /// Capacity hint for graph indexes
    pub ann_max_elements: usize,
    /// Search and timeout settings
    pub search: SearchConfig,
    /// Landing page served at `/`
    pub index_html: PathBuf,
}

/// Search and timeout settings of the similarity pipeline
#[derive(Clone, Debug, PartialEq)]
pub struct SearchConfig {
    /// Number of results returned per search
    pub top_k: usize,
    /// Candidates an approximate index considers, never below `top_k`
    pub num_candidates: usize,
    /// Bound on decoding plus extraction
    pub extract_timeout: Duration,
    /// Bound on searches, and on how long a write waits to reach the store
    pub store_timeout: Duration,
}

impl SearchConfig {
    /// Creates settings, raising `num_candidates` to `top_k` when smaller.
    pub fn new(top_k: usize, num_candidates: usize) -> Result<Self> {
        if top_k == 0 {
            return Err(AppError::Config("SEARCH_TOP_K must be at least 1".to_string()));
        }
        Ok(Self {
            top_k,
            num_candidates: num_candidates.max(top_k),
            ..Self::default()
        })
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 1,
            num_candidates: 10,
            extract_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            database_url: String::from("sqlite://imagelens.db"),
            max_upload_size: 16 * 1024 * 1024, // 16MB
            extractor: ExtractorKind::default(),
            model_weights: None,
            vector_index: IndexKind::default(),
            ann_max_elements: 1_000_000,
            search: SearchConfig::default(),
            index_html: PathBuf::from("index.html"),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("invalid {} `{}`: {}", key, value, e))),
        _ => Ok(default),
    }
}

impl Config {
    /// Reads the configuration from the process environment, after loading
    /// a `.env` file from the working directory if there is one.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            log::info!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let top_k = parse_var(&lookup, "SEARCH_TOP_K", defaults.search.top_k)?;
        let num_candidates = parse_var(&lookup, "SEARCH_CANDIDATES", defaults.search.num_candidates)?;
        let mut search = SearchConfig::new(top_k, num_candidates)?;
        search.extract_timeout = Duration::from_secs(parse_var(
            &lookup,
            "EXTRACT_TIMEOUT_SECS",
            defaults.search.extract_timeout.as_secs(),
        )?);
        search.store_timeout = Duration::from_secs(parse_var(
            &lookup,
            "STORE_TIMEOUT_SECS",
            defaults.search.store_timeout.as_secs(),
        )?);

        Ok(Self {
            bind_addr: parse_var(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            database_url: lookup("DATABASE_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.database_url),
            max_upload_size: parse_var(&lookup, "MAX_UPLOAD_SIZE", defaults.max_upload_size)?,
            extractor: parse_var(&lookup, "EXTRACTOR", defaults.extractor)?,
            model_weights: lookup("MODEL_WEIGHTS")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            vector_index: parse_var(&lookup, "VECTOR_INDEX", defaults.vector_index)?,
            ann_max_elements: parse_var(&lookup, "ANN_MAX_ELEMENTS", defaults.ann_max_elements)?,
            search,
            index_html: parse_var(&lookup, "INDEX_HTML", defaults.index_html)?,
        })
    }
}

/// Application state that can be shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// Shared ingest and search flows
    pub pipeline: Arc<SimilarityPipeline>,
    /// Where survey submissions go
    pub feedback: Arc<dyn FeedbackStore>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl AppState {
    /// Loads the extractor and opens the store named by the configuration.
    ///
    /// Model weights are loaded and the vector index is built here, once.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let extractor = build_extractor(config.extractor, config.model_weights.as_deref())?;
        log::info!(
            "Using {} extractor producing {} features",
            config.extractor,
            extractor.dimension()
        );

        if config.database_url == MEMORY_STORE_URL {
            log::warn!("Using in-memory store, records are lost on shutdown");
            let store = Arc::new(MemoryStore::with_index_kind(
                config.vector_index,
                config.ann_max_elements,
            ));
            return Ok(Self::with_components(config, extractor, store));
        }

        let options = SqliteOptions {
            index: config.vector_index,
            max_elements: config.ann_max_elements,
            dimension: Some(extractor.dimension()),
            busy_timeout: config.search.store_timeout,
        };
        let store = Arc::new(SqliteStore::connect(&config.database_url, options).await?);
        Ok(Self::with_components(config, extractor, store))
    }

    /// Create a new application state over already constructed services
    pub fn with_components<S>(
        config: Config,
        extractor: Arc<dyn FeatureExtractor>,
        store: Arc<S>,
    ) -> Arc<Self>
    where
        S: VectorStore + FeedbackStore + 'static,
    {
        let vectors: Arc<dyn VectorStore> = store.clone();
        let pipeline = SimilarityPipeline::new(extractor, vectors, config.search.clone());

        Arc::new(Self {
            config,
            pipeline: Arc::new(pipeline),
            feedback: store,
        })
    }
}
