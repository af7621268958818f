use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::Mutex;

use super::{blocking, Dimension, FeedbackStore, IndexKind, StoreError, VectorIndex, VectorStore};
use crate::models::feedback::Feedback;
use crate::models::record::{FeatureVector, ImageRecord, NewImageRecord, RecordId, ScoredRecord};

/// How a [`SqliteStore`] indexes its vectors.
#[derive(Debug, Clone, Copy)]
pub struct SqliteOptions {
    /// Index built at open and kept up to date on ingest.
    pub index: IndexKind,
    /// Capacity hint for graph indexes.
    pub max_elements: usize,
    /// Expected vector length, usually the extractor's; rows that disagree
    /// make the open fail.
    pub dimension: Option<usize>,
    /// Longest wait for a pooled connection or a locked database. Writes
    /// that cannot start within it fail without touching the store.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            index: IndexKind::default(),
            max_elements: 1_000_000,
            dimension: None,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

/// Records in SQLite, searched through an in-process [`VectorIndex`] that is
/// rebuilt from the stored vectors when the store is opened.
pub struct SqliteStore {
    pool: SqlitePool,
    index: Arc<dyn VectorIndex>,
    dimension: Dimension,
    // Serialises writes until the first one fixes the dimension
    first_write: Mutex<()>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("index", &self.index)
            .field("dimension", &self.dimension.get())
            .finish()
    }
}

fn encode_features(features: &[f32]) -> &[u8] {
    bytemuck::cast_slice(features)
}

fn decode_features(id: &str, blob: &[u8]) -> Result<FeatureVector, StoreError> {
    if blob.len() % std::mem::size_of::<f32>() != 0 {
        return Err(StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("feature blob of {} bytes", blob.len()),
        });
    }
    Ok(bytemuck::pod_collect_to_vec(blob))
}

fn record_from_row(row: &SqliteRow) -> Result<ImageRecord, StoreError> {
    let id: String = row.try_get("id").map_err(StoreError::Query)?;
    let features: Vec<u8> = row.try_get("features").map_err(StoreError::Query)?;
    let image: Vec<u8> = row.try_get("image").map_err(StoreError::Query)?;

    Ok(ImageRecord {
        features: decode_features(&id, &features)?,
        filename: row.try_get("filename").map_err(StoreError::Query)?,
        description: row.try_get("description").map_err(StoreError::Query)?,
        topic: row.try_get("topic").map_err(StoreError::Query)?,
        image: Bytes::from(image),
        id: RecordId::from_stored(id),
    })
}


impl SqliteStore {
    /// Opens (creating if missing) a database file.
    pub async fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self, StoreError> {
        let connect = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::open_with(connect, false, options).await
    }

    /// Opens a database from a connection string such as
    /// `sqlite://images.db` or `sqlite::memory:`.
    pub async fn connect(url: &str, options: SqliteOptions) -> Result<Self, StoreError> {
        let connect = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::Connection)?
            .create_if_missing(true);
        Self::open_with(connect, url.contains(":memory:"), options).await
    }

    async fn open_with(
        connect: SqliteConnectOptions,
        in_memory: bool,
        options: SqliteOptions,
    ) -> Result<Self, StoreError> {
        info!("Opening image store ({} index)", options.index);
        let connect = connect.busy_timeout(options.busy_timeout);

        let pool = if in_memory {
            // Every connection to `:memory:` is a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(options.busy_timeout)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(connect)
                .await
        } else {
            let connect = connect
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            SqlitePoolOptions::new()
                .acquire_timeout(options.busy_timeout)
                .connect_with(connect)
                .await
        }
        .map_err(StoreError::Connection)?;

        debug!("Applying store migrations");
        sqlx::migrate!().run(&pool).await.map_err(StoreError::Migration)?;

        let dimension = match options.dimension {
            Some(n) => Dimension::fixed(n),
            None => Dimension::default(),
        };

        let rows = sqlx::query("SELECT seq, id, features FROM images ORDER BY seq")
            .fetch_all(&pool)
            .await
            .map_err(StoreError::Query)?;

        let mut vectors = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq").map_err(StoreError::Query)?;
            let id: String = row.try_get("id").map_err(StoreError::Query)?;
            let blob: Vec<u8> = row.try_get("features").map_err(StoreError::Query)?;
            let features = decode_features(&id, &blob)?;
            dimension.commit(features.len())?;
            vectors.push((seq as usize, features));
        }

        let count = vectors.len();
        let index = options.index.build(options.max_elements.max(count));
        let index = blocking(move || {
            for (seq, features) in &vectors {
                index.insert(*seq, features);
            }
            index
        })
        .await?;
        info!("Indexed {} stored images", count);

        Ok(Self {
            pool,
            index,
            dimension,
            first_write: Mutex::new(()),
        })
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_by_seq(&self, seq: usize) -> Result<Option<ImageRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, features, filename, description, topic, image FROM images WHERE seq = ?",
        )
        .bind(seq as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn ingest(&self, record: NewImageRecord) -> Result<RecordId, StoreError> {
        let len = record.features.len();
        self.dimension.check(len)?;
        let _gate = match self.dimension.get() {
            Some(_) => None,
            None => {
                let gate = self.first_write.lock().await;
                self.dimension.check(len)?;
                Some(gate)
            }
        };

        let id = RecordId::generate();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO images (id, features, filename, description, topic, image, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(id.as_str())
        .bind(encode_features(&record.features))
        .bind(&record.filename)
        .bind(&record.description)
        .bind(&record.topic)
        .bind(record.image.as_ref())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Insert)?;
        self.dimension.commit(len)?;

        let index = Arc::clone(&self.index);
        let features = record.features;
        blocking(move || index.insert(seq as usize, &features)).await?;

        Ok(id)
    }

    async fn nearest_neighbors(
        &self,
        query: &[f32],
        k: usize,
        candidate_pool: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        self.dimension.check(query.len())?;
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let index = Arc::clone(&self.index);
        let query = query.to_vec();
        let pool = candidate_pool.max(k);
        let neighbors = blocking(move || index.search(&query, k, pool)).await?;

        let mut results = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            match self.fetch_by_seq(neighbor.seq).await? {
                Some(record) => results.push(ScoredRecord { record, score: neighbor.score }),
                None => warn!("Indexed vector {} has no stored record", neighbor.seq),
            }
        }
        Ok(results)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl FeedbackStore for SqliteStore {
    async fn submit_feedback(&self, feedback: Feedback) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO feedback (rate, comment, created_at) VALUES (?, ?, ?)")
            .bind(&feedback.rate)
            .bind(&feedback.comment)
            .bind(feedback.submitted_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(StoreError::Insert)?;
        Ok(())
    }
}

impl SqliteStore {
    /// Number of stored feedback submissions.
    pub async fn feedback_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(count as u64)
    }
}
