//! Core data model: documents, chunks, and their sparse/dense encodings.
//!
//! See spec §3. Every closed record carries a small `extra` map for
//! forward-compatible fields (DESIGN NOTES "Dynamic typing of payload").

use serde::{Deserialize, Serialize};
use std::collections::{hash_map::DefaultHasher, BTreeMap};
use std::hash::{Hash, Hasher};

pub type Extra = BTreeMap<String, serde_json::Value>;

/// A logical file submitted for indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub content: String,
    pub language: Option<String>,
    #[serde(default)]
    pub extra: Extra,
}

impl Document {
    pub fn content_hash(&self) -> String {
        content_hash(&self.content)
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Stable content hash used for no-op skip detection and point-identity.
///
/// Not cryptographic — a 64-bit `DefaultHasher` digest is sufficient for
/// content-addressed skip/dedup decisions within a single store, and avoids
/// pulling in a hashing crate the teacher never needed.
pub fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// A contiguous, structure-aware span of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_hash: String,
    pub path: String,
    pub language: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
    pub text: String,
    pub symbols: Vec<String>,
    pub chunk_hash: String,
    #[serde(default)]
    pub extra: Extra,
}

impl Chunk {
    /// Stable id derived from `(doc_hash, start_line, end_line)`, per spec §4.4.
    pub fn derive_id(doc_hash: &str, start_line: usize, end_line: usize) -> String {
        let mut hasher = DefaultHasher::new();
        doc_hash.hash(&mut hasher);
        start_line.hash(&mut hasher);
        end_line.hash(&mut hasher);
        format!("{doc_hash}-{start_line}-{end_line}-{:08x}", hasher.finish() as u32)
    }
}

/// Sparse (BM25-style) vector: parallel token-id/weight arrays, sorted by
/// weight descending, truncated to top-K per chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub weights: Vec<f32>,
}

impl SparseVector {
    pub fn truncate_top_k(mut self, k: usize) -> Self {
        let mut pairs: Vec<(u32, f32)> =
            self.indices.into_iter().zip(self.weights.into_iter()).collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs.truncate(k);
        self.indices = pairs.iter().map(|p| p.0).collect();
        self.weights = pairs.iter().map(|p| p.1).collect();
        self
    }

    pub fn dot(&self, other: &SparseVector) -> f64 {
        use std::collections::HashMap;
        let mine: HashMap<u32, f32> = self.indices.iter().copied().zip(self.weights.iter().copied()).collect();
        let mut score = 0.0f64;
        for (idx, w) in other.indices.iter().zip(other.weights.iter()) {
            if let Some(mw) = mine.get(idx) {
                score += (*mw as f64) * (*w as f64);
            }
        }
        score
    }
}

/// Fixed-dimension dense embedding, L2-normalized so dot product == cosine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseVector(pub Vec<f32>);

impl DenseVector {
    pub fn normalize(mut self) -> Self {
        let norm: f32 = self.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-9 {
            for v in self.0.iter_mut() {
                *v /= norm;
            }
        }
        self
    }

    pub fn cosine(&self, other: &DenseVector) -> f32 {
        self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum()
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash("fn main() {}");
        let b = content_hash("fn main() {}");
        assert_eq!(a, b);
        let c = content_hash("fn main() { println!(); }");
        assert_ne!(a, c);
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let id1 = Chunk::derive_id("abc", 1, 10);
        let id2 = Chunk::derive_id("abc", 1, 10);
        assert_eq!(id1, id2);
        let id3 = Chunk::derive_id("abc", 1, 11);
        assert_ne!(id1, id3);
    }

    #[test]
    fn sparse_dot_product() {
        let a = SparseVector { indices: vec![1, 2, 3], weights: vec![1.0, 2.0, 3.0] };
        let b = SparseVector { indices: vec![2, 3, 4], weights: vec![1.0, 1.0, 1.0] };
        assert_eq!(a.dot(&b), 2.0 * 1.0 + 3.0 * 1.0);
    }

    #[test]
    fn dense_cosine_of_normalized_is_one_for_self() {
        let v = DenseVector(vec![3.0, 4.0]).normalize();
        let sim = v.cosine(&v);
        assert!((sim - 1.0).abs() < 1e-6);
    }
}
