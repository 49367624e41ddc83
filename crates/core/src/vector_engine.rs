//! Vector engine abstraction (spec §6): the concrete ANN/full-text engine is
//! an external collaborator. This module defines the capability contract the
//! core requires of it, plus an in-memory reference implementation used for
//! tests and for running the system with no external engine at all.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::document::{DenseVector, SparseVector};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub dense: Option<DenseVector>,
    pub sparse: Option<SparseVector>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub path_prefix: Option<String>,
    /// Exact-match path set, for `Delete(store, paths[])` (spec §4.5):
    /// "remove all points whose `path` equals any entry". Distinct from
    /// `path_prefix`, which is a prefix match used by delete-by-prefix and
    /// search-time path filtering.
    pub paths: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
    pub connection_id: Option<String>,
}

impl VectorFilter {
    fn matches(&self, payload: &HashMap<String, serde_json::Value>) -> bool {
        if let Some(prefix) = &self.path_prefix {
            let path = payload.get("path").and_then(|v| v.as_str()).unwrap_or("");
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(paths) = &self.paths {
            let path = payload.get("path").and_then(|v| v.as_str()).unwrap_or("");
            if !paths.iter().any(|p| p == path) {
                return false;
            }
        }
        if let Some(languages) = &self.languages {
            let lang = payload.get("language").and_then(|v| v.as_str());
            match lang {
                Some(l) if languages.iter().any(|x| x == l) => {}
                _ => return false,
            }
        }
        if let Some(conn) = &self.connection_id {
            let payload_conn = payload.get("connection_id").and_then(|v| v.as_str());
            if payload_conn != Some(conn.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub enum QueryMode {
    DenseOnly,
    SparseOnly,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: HashMap<String, serde_json::Value>,
}

/// The capability contract the core requires of a concrete vector/full-text
/// engine (spec §6): collections keyed by name, UUID-addressed points, and
/// filtered dense/sparse query, count, scroll, and delete operations.
#[async_trait]
pub trait VectorEngine: Send + Sync {
    async fn create_collection(&self, name: &str, dense_dim: usize) -> CoreResult<()>;
    async fn drop_collection(&self, name: &str) -> CoreResult<()>;
    async fn upsert(&self, collection: &str, points: Vec<Point>) -> CoreResult<()>;
    async fn query(
        &self,
        collection: &str,
        mode: QueryMode,
        dense: Option<&DenseVector>,
        sparse: Option<&SparseVector>,
        filter: &VectorFilter,
        limit: usize,
    ) -> CoreResult<Vec<ScoredPoint>>;
    async fn count(&self, collection: &str, filter: &VectorFilter) -> CoreResult<usize>;
    async fn scroll(&self, collection: &str, filter: &VectorFilter) -> CoreResult<Vec<Point>>;
    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> CoreResult<usize>;
    async fn delete_by_filter(&self, collection: &str, filter: &VectorFilter) -> CoreResult<usize>;
    async fn health(&self) -> CoreResult<String>;
}

struct Collection {
    dense_dim: usize,
    points: HashMap<String, Point>,
}

/// Single-process reference implementation; brute-force scans, adequate for
/// tests and small local stores, not a substitute for a real ANN engine.
#[derive(Default)]
pub struct InMemoryVectorEngine {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorEngine for InMemoryVectorEngine {
    async fn create_collection(&self, name: &str, dense_dim: usize) -> CoreResult<()> {
        self.collections
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Collection { dense_dim, points: HashMap::new() });
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> CoreResult<()> {
        self.collections.write().unwrap().remove(name);
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<Point>) -> CoreResult<()> {
        let mut collections = self.collections.write().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}' not found")))?;
        for point in points {
            if let Some(dense) = &point.dense {
                if dense.dim() != coll.dense_dim {
                    return Err(CoreError::validation(format!(
                        "dense vector dim {} does not match collection dim {}",
                        dense.dim(),
                        coll.dense_dim
                    )));
                }
            }
            coll.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        mode: QueryMode,
        dense: Option<&DenseVector>,
        sparse: Option<&SparseVector>,
        filter: &VectorFilter,
        limit: usize,
    ) -> CoreResult<Vec<ScoredPoint>> {
        let collections = self.collections.read().unwrap();
        let coll = collections
            .get(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}' not found")))?;
        let mut scored: Vec<ScoredPoint> = coll
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .filter_map(|p| {
                let score = match mode {
                    QueryMode::DenseOnly => match (dense, &p.dense) {
                        (Some(q), Some(d)) => q.cosine(d) as f64,
                        _ => return None,
                    },
                    QueryMode::SparseOnly => match (sparse, &p.sparse) {
                        (Some(q), Some(s)) => q.dot(s),
                        _ => return None,
                    },
                };
                Some(ScoredPoint { id: p.id.clone(), score, payload: p.payload.clone() })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn count(&self, collection: &str, filter: &VectorFilter) -> CoreResult<usize> {
        let collections = self.collections.read().unwrap();
        let coll = collections
            .get(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}' not found")))?;
        Ok(coll.points.values().filter(|p| filter.matches(&p.payload)).count())
    }

    async fn scroll(&self, collection: &str, filter: &VectorFilter) -> CoreResult<Vec<Point>> {
        let collections = self.collections.read().unwrap();
        let coll = collections
            .get(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}' not found")))?;
        Ok(coll.points.values().filter(|p| filter.matches(&p.payload)).cloned().collect())
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> CoreResult<usize> {
        let mut collections = self.collections.write().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}' not found")))?;
        let mut removed = 0;
        for id in ids {
            if coll.points.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &VectorFilter) -> CoreResult<usize> {
        let mut collections = self.collections.write().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| CoreError::not_found(format!("collection '{collection}' not found")))?;
        let to_remove: Vec<String> =
            coll.points.values().filter(|p| filter.matches(&p.payload)).map(|p| p.id.clone()).collect();
        for id in &to_remove {
            coll.points.remove(id);
        }
        Ok(to_remove.len())
    }

    async fn health(&self) -> CoreResult<String> {
        Ok("in-memory-v1".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, path: &str, dense: Vec<f32>) -> Point {
        let mut payload = HashMap::new();
        payload.insert("path".to_string(), serde_json::json!(path));
        Point { id: id.to_string(), dense: Some(DenseVector(dense).normalize()), sparse: None, payload }
    }

    #[tokio::test]
    async fn upsert_and_dense_query_roundtrip() {
        let engine = InMemoryVectorEngine::new();
        engine.create_collection("c1", 2).await.unwrap();
        engine
            .upsert("c1", vec![point("a", "a.rs", vec![1.0, 0.0]), point("b", "b.rs", vec![0.0, 1.0])])
            .await
            .unwrap();
        let query = DenseVector(vec![1.0, 0.0]).normalize();
        let results = engine
            .query("c1", QueryMode::DenseOnly, Some(&query), None, &VectorFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(results[0].id, "a");
    }

    #[tokio::test]
    async fn filter_by_path_prefix() {
        let engine = InMemoryVectorEngine::new();
        engine.create_collection("c1", 2).await.unwrap();
        engine
            .upsert("c1", vec![point("a", "src/a.rs", vec![1.0, 0.0]), point("b", "docs/b.rs", vec![1.0, 0.0])])
            .await
            .unwrap();
        let filter = VectorFilter { path_prefix: Some("src/".to_string()), ..Default::default() };
        let count = engine.count("c1", &filter).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn delete_by_filter_removes_matching() {
        let engine = InMemoryVectorEngine::new();
        engine.create_collection("c1", 2).await.unwrap();
        engine.upsert("c1", vec![point("a", "src/a.rs", vec![1.0, 0.0])]).await.unwrap();
        let filter = VectorFilter { path_prefix: Some("src/".to_string()), ..Default::default() };
        let removed = engine.delete_by_filter("c1", &filter).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(engine.count("c1", &VectorFilter::default()).await.unwrap(), 0);
    }
}
