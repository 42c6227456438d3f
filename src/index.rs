//! In-memory approximate-nearest-neighbor index over chunk embeddings.
//!
//! Vectors are L2-normalized on insertion, so cosine distance reduces to
//! `1 - dot`. Queries run against an HNSW graph rebuilt after each corpus
//! mutation; below a small corpus size the exact scan is both faster and
//! simpler, so the graph is only built past [`HNSW_BUILD_THRESHOLD`]
//! entries and the exact path doubles as the fallback.
//!
//! The index is a cache over the `document_chunks` table: it is loaded from
//! the store at startup and updated after every committed ingest or delete,
//! which gives queries read-your-writes visibility.

use instant_distance::{Builder, HnswMap, Point, Search};
use uuid::Uuid;

/// Entry count below which the exact scan is used directly.
const HNSW_BUILD_THRESHOLD: usize = 64;

/// One indexed chunk embedding.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    /// L2-normalized embedding.
    pub vector: Vec<f32>,
}

#[derive(Clone)]
struct IndexPoint(Vec<f32>);

impl Point for IndexPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Normalized vectors: cosine distance is 1 - dot.
        let dot: f32 = self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum();
        1.0 - dot
    }
}

pub struct VectorIndex {
    dims: usize,
    entries: Vec<IndexEntry>,
    hnsw: Option<HnswMap<IndexPoint, usize>>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            entries: Vec::new(),
            hnsw: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add entries (normalizing their vectors) and rebuild the graph.
    pub fn insert(&mut self, entries: impl IntoIterator<Item = IndexEntry>) {
        for mut entry in entries {
            normalize(&mut entry.vector);
            self.entries.push(entry);
        }
        self.rebuild();
    }

    /// Drop all entries of a document and rebuild the graph.
    pub fn remove_document(&mut self, document_id: Uuid) {
        self.entries.retain(|e| e.document_id != document_id);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        if self.entries.len() < HNSW_BUILD_THRESHOLD {
            self.hnsw = None;
            return;
        }
        let points: Vec<IndexPoint> = self
            .entries
            .iter()
            .map(|e| IndexPoint(e.vector.clone()))
            .collect();
        let values: Vec<usize> = (0..self.entries.len()).collect();
        self.hnsw = Some(Builder::default().build(points, values));
    }

    /// K-nearest chunks by cosine similarity, descending.
    pub fn knn(&self, query: &[f32], k: usize) -> Vec<(Uuid, f64)> {
        if query.len() != self.dims || self.entries.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut normalized = query.to_vec();
        normalize(&mut normalized);

        match &self.hnsw {
            Some(map) => {
                let mut search = Search::default();
                let point = IndexPoint(normalized);
                map.search(&point, &mut search)
                    .take(k)
                    .map(|item| {
                        let entry = &self.entries[*item.value];
                        (entry.chunk_id, 1.0 - item.distance as f64)
                    })
                    .collect()
            }
            None => self.exact_knn(&normalized, k),
        }
    }

    fn exact_knn(&self, normalized_query: &[f32], k: usize) -> Vec<(Uuid, f64)> {
        let mut scored: Vec<(Uuid, f64)> = self
            .entries
            .iter()
            .map(|e| {
                let dot: f32 = e
                    .vector
                    .iter()
                    .zip(normalized_query.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                (e.chunk_id, dot as f64)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// Scale a vector to unit length. Zero vectors are left unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in `[-1, 1]`; 0.0 for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Encode a float vector as a little-endian `f32` BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
