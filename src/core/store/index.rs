use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::core::embeddings::cosine_similarity;

/// A hit from a [`VectorIndex`]: the insertion sequence of the stored vector
/// and its cosine similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Insertion sequence the vector was indexed under.
    pub seq: usize,
    /// Cosine similarity, higher is more similar.
    pub score: f32,
}

/// Orders neighbours by descending score, then ascending insertion sequence.
pub(crate) fn rank(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.seq.cmp(&b.seq),
        ord => ord,
    });
}

/// In-process nearest-neighbour index over feature vectors.
///
/// Indexes are synchronous and may be CPU heavy; callers in async code run
/// `search` on the blocking pool.
pub trait VectorIndex: Send + Sync + fmt::Debug {
    /// Adds a vector under its insertion sequence.
    fn insert(&self, seq: usize, vector: &[f32]);

    /// Returns at most `k` neighbours ranked by [`Neighbor::score`].
    /// `candidate_pool` bounds how many candidates an approximate index
    /// considers and is never smaller than `k`.
    fn search(&self, query: &[f32], k: usize, candidate_pool: usize) -> Vec<Neighbor>;

    /// Number of indexed vectors.
    fn len(&self) -> usize;

    /// Whether the index holds no vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which [`VectorIndex`] a durable store builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Exact brute-force scan, see [`FlatIndex`].
    Flat,
    /// Approximate graph index, see [`HnswIndex`].
    Hnsw,
}

impl Default for IndexKind {
    fn default() -> Self {
        if cfg!(feature = "hnsw") {
            Self::Hnsw
        } else {
            Self::Flat
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => f.write_str("flat"),
            Self::Hnsw => f.write_str("hnsw"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "hnsw" => Ok(Self::Hnsw),
            other => Err(format!("unknown vector index `{}`", other)),
        }
    }
}

impl IndexKind {
    /// Creates an empty index of this kind.
    pub fn build(self, max_elements: usize) -> Arc<dyn VectorIndex> {
        match self {
            Self::Flat => Arc::new(FlatIndex::default()),
            #[cfg(feature = "hnsw")]
            Self::Hnsw => Arc::new(HnswIndex::new(max_elements)),
            #[cfg(not(feature = "hnsw"))]
            Self::Hnsw => {
                log::warn!("HNSW index requested without the `hnsw` feature, using flat index");
                let _ = max_elements;
                Arc::new(FlatIndex::default())
            }
        }
    }
}

/// Exact index: scores every stored vector. Fine for small collections.
#[derive(Debug, Default)]
pub struct FlatIndex {
    vectors: RwLock<Vec<(usize, Vec<f32>)>>,
}

impl VectorIndex for FlatIndex {
    fn insert(&self, seq: usize, vector: &[f32]) {
        let mut vectors = self.vectors.write().unwrap_or_else(|e| e.into_inner());
        vectors.push((seq, vector.to_vec()));
    }

    fn search(&self, query: &[f32], k: usize, _candidate_pool: usize) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        let vectors = self.vectors.read().unwrap_or_else(|e| e.into_inner());
        let mut neighbors: Vec<Neighbor> = vectors
            .iter()
            .map(|(seq, vector)| Neighbor { seq: *seq, score: cosine_similarity(query, vector) })
            .collect();
        rank(&mut neighbors);
        neighbors.truncate(k);
        neighbors
    }

    fn len(&self) -> usize {
        self.vectors.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(feature = "hnsw")]
pub use self::hnsw::HnswIndex;

#[cfg(feature = "hnsw")]
mod hnsw {
    use std::collections::HashSet;
    use std::fmt;
    use std::sync::RwLock;

    use hnsw_rs::prelude::*;

    use super::{rank, Neighbor, VectorIndex};

    const MAX_NB_CONNECTION: usize = 32;
    const MAX_LAYER: usize = 16;
    const EF_CONSTRUCTION: usize = 200;

    fn is_zero(vector: &[f32]) -> bool {
        vector.iter().all(|x| *x == 0.0)
    }

    /// Approximate index backed by a hierarchical navigable small world graph
    /// under cosine distance.
    ///
    /// Zero vectors score 0 against everything, as in [`FlatIndex`](super::FlatIndex).
    pub struct HnswIndex {
        index: Hnsw<'static, f32, DistCosine>,
        // DistCosine puts these at distance 0 from any query
        zero_norm: RwLock<HashSet<usize>>,
    }

    impl fmt::Debug for HnswIndex {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("HnswIndex").field("points", &self.index.get_nb_point()).finish()
        }
    }

    impl HnswIndex {
        /// Creates an empty graph sized for up to `max_elements` vectors.
        pub fn new(max_elements: usize) -> Self {
            let index = Hnsw::<f32, DistCosine>::new(
                MAX_NB_CONNECTION,
                max_elements.max(1),
                MAX_LAYER,
                EF_CONSTRUCTION,
                DistCosine {},
            );
            Self { index, zero_norm: RwLock::new(HashSet::new()) }
        }
    }

    impl VectorIndex for HnswIndex {
        fn insert(&self, seq: usize, vector: &[f32]) {
            if is_zero(vector) {
                self.zero_norm.write().unwrap_or_else(|e| e.into_inner()).insert(seq);
            }
            self.index.insert((vector, seq));
        }

        fn search(&self, query: &[f32], k: usize, candidate_pool: usize) -> Vec<Neighbor> {
            if k == 0 || self.index.get_nb_point() == 0 {
                return Vec::new();
            }
            let zero_query = is_zero(query);
            let zero_norm = self.zero_norm.read().unwrap_or_else(|e| e.into_inner());
            let mut neighbors: Vec<Neighbor> = self
                .index
                .search(query, k, candidate_pool.max(k))
                .into_iter()
                .map(|n| {
                    let score = if zero_query || zero_norm.contains(&n.d_id) {
                        0.0
                    } else {
                        // DistCosine is 1 - cos
                        1.0 - n.distance
                    };
                    Neighbor { seq: n.d_id, score }
                })
                .collect();
            rank(&mut neighbors);
            neighbors.truncate(k);
            neighbors
        }

        fn len(&self) -> usize {
            self.index.get_nb_point()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_index_empty() {
        let index = FlatIndex::default();
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0], 5, 10).is_empty());
    }

    #[test]
    fn test_flat_index_orders_by_similarity() {
        let index = FlatIndex::default();
        index.insert(0, &[0.0, 1.0]);
        index.insert(1, &[1.0, 0.0]);
        index.insert(2, &[1.0, 1.0]);

        let hits = index.search(&[1.0, 0.1], 3, 3);
        let order: Vec<usize> = hits.iter().map(|n| n.seq).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_flat_index_ties_follow_insertion_order() {
        let index = FlatIndex::default();
        index.insert(7, &[2.0, 0.0]);
        index.insert(3, &[1.0, 0.0]);
        index.insert(5, &[3.0, 0.0]);

        let hits = index.search(&[1.0, 0.0], 2, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].seq, 3);
        assert_eq!(hits[1].seq, 5);
    }

    #[test]
    fn test_index_kind_parsing() {
        assert_eq!("FLAT".parse::<IndexKind>().unwrap(), IndexKind::Flat);
        assert_eq!("hnsw".parse::<IndexKind>().unwrap(), IndexKind::Hnsw);
        assert!("ivf".parse::<IndexKind>().is_err());
    }

    #[cfg(feature = "hnsw")]
    #[test]
    fn test_hnsw_index_finds_exact_match() {
        let index = HnswIndex::new(100);
        for seq in 0..50usize {
            let angle = seq as f32 * 0.1;
            index.insert(seq, &[angle.cos(), angle.sin(), 0.5]);
        }
        assert_eq!(index.len(), 50);

        let angle = 17.0f32 * 0.1;
        let hits = index.search(&[angle.cos(), angle.sin(), 0.5], 3, 32);
        assert_eq!(hits[0].seq, 17);
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[cfg(feature = "hnsw")]
    #[test]
    fn test_hnsw_zero_vector_scores_zero() {
        let index = HnswIndex::new(10);
        index.insert(1, &[0.0, 0.0, 0.0]);
        index.insert(2, &[0.0, 1.0, 0.0]);

        let hits = index.search(&[1.0, 0.0, 0.0], 2, 10);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|n| n.score.abs() < 1e-6), "{:?}", hits);

        let hits = index.search(&[0.0, 1.0, 0.0], 2, 10);
        assert_eq!(hits[0].seq, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits.iter().filter(|n| n.seq == 1).all(|n| n.score == 0.0));
    }

    #[cfg(feature = "hnsw")]
    #[test]
    fn test_hnsw_matches_flat_scores_for_zero_vectors() {
        let flat = FlatIndex::default();
        let hnsw = HnswIndex::new(10);
        for (seq, vector) in [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]].iter().enumerate() {
            flat.insert(seq, vector);
            hnsw.insert(seq, vector);
        }

        for query in [[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]] {
            let mut expected = flat.search(&query, 3, 10);
            let mut actual = hnsw.search(&query, 3, 10);
            expected.sort_by_key(|n| n.seq);
            actual.sort_by_key(|n| n.seq);
            assert_eq!(actual.len(), expected.len());
            for (a, e) in actual.iter().zip(&expected) {
                assert_eq!(a.seq, e.seq);
                assert!((a.score - e.score).abs() < 1e-5, "{:?} vs {:?}", actual, expected);
            }
        }
    }
}
