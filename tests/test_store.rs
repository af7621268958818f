use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::sync::Arc;

use bytes::Bytes;
use predicates::prelude::*;
use tokio_test::assert_err;

use imagelens::{
    Feedback, FeedbackStore, IndexKind, NewImageRecord, SqliteOptions, SqliteStore, StoreError,
    VectorStore,
};

fn options(index: IndexKind, dimension: usize) -> SqliteOptions {
    SqliteOptions {
        index,
        max_elements: 1_000,
        dimension: Some(dimension),
        ..SqliteOptions::default()
    }
}

fn record(filename: &str, features: Vec<f32>) -> NewImageRecord {
    NewImageRecord {
        features,
        filename: filename.to_string(),
        description: format!("{} description", filename),
        topic: "test".to_string(),
        image: Bytes::from(format!("{} bytes", filename)),
    }
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.child("images.db");

    let store = SqliteStore::open(db.path(), options(IndexKind::Flat, 4)).await.unwrap();
    store.ingest(record("a.png", vec![1.0, 0.0, 0.0, 0.0])).await.unwrap();
    let b = store.ingest(record("b.png", vec![0.0, 1.0, 0.0, 0.0])).await.unwrap();
    store.close().await;

    db.assert(predicate::path::is_file());

    let store = SqliteStore::open(db.path(), options(IndexKind::Flat, 4)).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);

    let hits = store.nearest_neighbors(&[0.0, 1.0, 0.0, 0.0], 1, 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.id, b);
    assert_eq!(hits[0].record.filename, "b.png");
    assert_eq!(hits[0].record.description, "b.png description");
    assert_eq!(hits[0].record.image, Bytes::from("b.png bytes"));
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    store.close().await;
}

#[tokio::test]
async fn test_ranking_and_ties() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.child("images.db").path(), options(IndexKind::Flat, 2))
        .await
        .unwrap();

    store.ingest(record("far.png", vec![0.0, 1.0])).await.unwrap();
    store.ingest(record("first.png", vec![1.0, 0.0])).await.unwrap();
    store.ingest(record("second.png", vec![2.0, 0.0])).await.unwrap();

    let hits = store.nearest_neighbors(&[1.0, 0.0], 3, 3).await.unwrap();
    let names: Vec<_> = hits.iter().map(|h| h.record.filename.as_str()).collect();
    assert_eq!(names, ["first.png", "second.png", "far.png"]);

    assert!(store.nearest_neighbors(&[1.0, 0.0], 0, 10).await.unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_dimension_is_enforced() {
    let dir = TempDir::new().unwrap();
    let db = dir.child("images.db");

    let store = SqliteStore::open(db.path(), options(IndexKind::Flat, 4)).await.unwrap();
    store.ingest(record("a.png", vec![1.0, 0.0, 0.0, 0.0])).await.unwrap();

    let err = assert_err!(store.ingest(record("short.png", vec![1.0, 0.0])).await);
    assert!(matches!(err, StoreError::Dimension { expected: 4, actual: 2 }), "{:?}", err);
    let err = assert_err!(store.nearest_neighbors(&[1.0; 8], 1, 10).await);
    assert!(matches!(err, StoreError::Dimension { .. }), "{:?}", err);
    assert_eq!(store.count().await.unwrap(), 1);
    store.close().await;

    // A different extractor cannot reuse the database
    let err = assert_err!(SqliteStore::open(db.path(), options(IndexKind::Flat, 8)).await);
    assert!(matches!(err, StoreError::Dimension { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_empty_store_yields_no_matches() {
    let store = SqliteStore::connect("sqlite::memory:", options(IndexKind::Flat, 3))
        .await
        .unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(store.nearest_neighbors(&[1.0, 2.0, 3.0], 5, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_feedback_is_stored() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.child("images.db").path(), options(IndexKind::Flat, 4))
        .await
        .unwrap();

    store.submit_feedback(Feedback::new("5", None)).await.unwrap();
    store
        .submit_feedback(Feedback::new("2", Some("too slow".to_string())))
        .await
        .unwrap();

    assert_eq!(store.feedback_count().await.unwrap(), 2);
    assert_eq!(store.count().await.unwrap(), 0);
    store.close().await;
}

#[cfg(feature = "hnsw")]
#[tokio::test]
async fn test_hnsw_index_is_rebuilt_on_open() {
    let dir = TempDir::new().unwrap();
    let db = dir.child("images.db");

    let store = SqliteStore::open(db.path(), options(IndexKind::Hnsw, 3)).await.unwrap();
    store.ingest(record("x.png", vec![1.0, 0.0, 0.0])).await.unwrap();
    store.ingest(record("y.png", vec![0.0, 1.0, 0.0])).await.unwrap();
    store.ingest(record("z.png", vec![0.0, 0.0, 1.0])).await.unwrap();
    store.close().await;

    let store = SqliteStore::open(db.path(), options(IndexKind::Hnsw, 3)).await.unwrap();
    let hits = store.nearest_neighbors(&[0.0, 0.0, 1.0], 1, 10).await.unwrap();
    assert_eq!(hits[0].record.filename, "z.png");
    assert!((hits[0].score - 1.0).abs() < 1e-4);
    store.close().await;
}

fn one_hot(dimension: usize, hot: usize) -> Vec<f32> {
    let mut features = vec![0.0; dimension];
    features[hot] = 1.0;
    features
}

async fn concurrent_ingest_and_search(index: IndexKind) {
    const WRITERS: usize = 16;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteStore::open(dir.child("images.db").path(), options(index, WRITERS))
            .await
            .unwrap(),
    );

    let writes: Vec<_> = (0..WRITERS)
        .map(|n| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store.ingest(record(&format!("{}.png", n), one_hot(WRITERS, n))).await
            })
        })
        .collect();
    for write in writes {
        write.await.unwrap().unwrap();
    }
    assert_eq!(store.count().await.unwrap(), WRITERS as u64);

    let reads: Vec<_> = (0..WRITERS)
        .map(|n| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let hits = store.nearest_neighbors(&one_hot(WRITERS, n), 1, 32).await.unwrap();
                (n, hits)
            })
        })
        .collect();
    for read in reads {
        let (n, hits) = read.await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.filename, format!("{}.png", n));
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_and_search_flat() {
    concurrent_ingest_and_search(IndexKind::Flat).await;
}

#[cfg(feature = "hnsw")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_and_search_hnsw() {
    concurrent_ingest_and_search(IndexKind::Hnsw).await;
}
