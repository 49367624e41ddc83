//! Hybrid retriever (spec §4.7): concurrent sparse + dense search fused by
//! Reciprocal Rank Fusion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::document::{DenseVector, SparseVector};
use crate::error::CoreResult;
use crate::vector_engine::{QueryMode, ScoredPoint, VectorEngine, VectorFilter};

pub const DEFAULT_RRF_K: f64 = 60.0;
const DEFAULT_PREFETCH_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub score: f64,
    pub payload: HashMap<String, serde_json::Value>,
    pub sparse_rank: Option<usize>,
    pub dense_rank: Option<usize>,
}

pub struct RetrievalRequest<'a> {
    pub collection: &'a str,
    pub dense: Option<&'a DenseVector>,
    pub sparse: Option<&'a SparseVector>,
    pub filter: VectorFilter,
    pub prefetch_limit: usize,
    pub final_limit: usize,
    pub sparse_weight: f64,
    pub dense_weight: f64,
    pub rrf_k: f64,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(collection: &'a str, final_limit: usize) -> Self {
        Self {
            collection,
            dense: None,
            sparse: None,
            filter: VectorFilter::default(),
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            final_limit,
            sparse_weight: 0.5,
            dense_weight: 0.5,
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

/// Fused candidates plus the pre-fusion candidate count each retriever
/// contributed, for telemetry.
pub struct RetrievalOutcome {
    pub fused: Vec<FusedCandidate>,
    pub sparse_count: usize,
    pub dense_count: usize,
}

/// Issues sparse and dense retrieval concurrently and fuses with RRF.
/// `dense_collection` and `sparse_collection` may be the same physical
/// collection if the engine stores both vector kinds together.
pub async fn retrieve(
    engine: &Arc<dyn VectorEngine>,
    dense_collection: &str,
    sparse_collection: &str,
    request: RetrievalRequest<'_>,
) -> CoreResult<RetrievalOutcome> {
    let sparse_fut = async {
        match request.sparse {
            Some(sparse) => {
                engine
                    .query(sparse_collection, QueryMode::SparseOnly, None, Some(sparse), &request.filter, request.prefetch_limit)
                    .await
                    .map(Some)
            }
            None => Ok(None),
        }
    };
    let dense_fut = async {
        match request.dense {
            Some(dense) => {
                engine
                    .query(dense_collection, QueryMode::DenseOnly, Some(dense), None, &request.filter, request.prefetch_limit)
                    .await
                    .map(Some)
            }
            None => Ok(None),
        }
    };
    let (sparse_points, dense_points) = tokio::try_join!(sparse_fut, dense_fut)?;
    let sparse_points = sparse_points.unwrap_or_default();
    let dense_points = dense_points.unwrap_or_default();
    let sparse_count = sparse_points.len();
    let dense_count = dense_points.len();

    let fused = fuse(sparse_points, dense_points, request.sparse_weight, request.dense_weight, request.rrf_k, request.final_limit);

    Ok(RetrievalOutcome { fused, sparse_count, dense_count })
}

/// Reciprocal Rank Fusion: for each unique chunk id,
/// `score = sum_side(w_side / (k + rank_side))`. Rank-order-only — scaling
/// either side's raw scores by a positive constant never changes output
/// rankings, since only rank positions are used.
pub fn fuse(
    sparse: Vec<ScoredPoint>,
    dense: Vec<ScoredPoint>,
    sparse_weight: f64,
    dense_weight: f64,
    k: f64,
    limit: usize,
) -> Vec<FusedCandidate> {
    let mut ranks: HashMap<String, (Option<usize>, Option<usize>, HashMap<String, serde_json::Value>)> =
        HashMap::new();

    for (rank, point) in sparse.into_iter().enumerate() {
        let entry = ranks.entry(point.id.clone()).or_insert_with(|| (None, None, point.payload.clone()));
        entry.0 = Some(rank + 1);
        entry.2 = point.payload;
    }
    for (rank, point) in dense.into_iter().enumerate() {
        let entry = ranks.entry(point.id.clone()).or_insert_with(|| (None, None, point.payload.clone()));
        entry.1 = Some(rank + 1);
        entry.2 = point.payload;
    }

    let mut fused: Vec<FusedCandidate> = ranks
        .into_iter()
        .map(|(chunk_id, (sparse_rank, dense_rank, payload))| {
            let mut score = 0.0;
            if let Some(r) = sparse_rank {
                score += sparse_weight / (k + r as f64);
            }
            if let Some(r) = dense_rank {
                score += dense_weight / (k + r as f64);
            }
            FusedCandidate { chunk_id, score, payload, sparse_rank, dense_rank }
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(limit);
    fused
}

/// Races two futures, allowing an already-sufficient side to proceed without
/// waiting for a slow laggard once its own deadline elapses. Returns
/// `(sparse, dense)`; a cancelled side yields `None`.
pub async fn retrieve_with_deadline<F1, F2>(
    sparse_fut: F1,
    dense_fut: F2,
    deadline: Duration,
) -> (Option<Vec<ScoredPoint>>, Option<Vec<ScoredPoint>>)
where
    F1: std::future::Future<Output = CoreResult<Vec<ScoredPoint>>>,
    F2: std::future::Future<Output = CoreResult<Vec<ScoredPoint>>>,
{
    let (sparse_res, dense_res) = tokio::join!(
        tokio::time::timeout(deadline, sparse_fut),
        tokio::time::timeout(deadline, dense_fut),
    );
    (sparse_res.ok().and_then(|r| r.ok()), dense_res.ok().and_then(|r| r.ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, score: f64) -> ScoredPoint {
        ScoredPoint { id: id.to_string(), score, payload: HashMap::new() }
    }

    #[test]
    fn fusion_is_rank_order_only() {
        let sparse_a = vec![point("x", 100.0), point("y", 50.0)];
        let sparse_b = vec![point("x", 1.0), point("y", 0.5)];
        let dense = vec![point("y", 0.9), point("x", 0.1)];

        let fused_a = fuse(sparse_a, dense.clone(), 0.5, 0.5, 60.0, 10);
        let fused_b = fuse(sparse_b, dense, 0.5, 0.5, 60.0, 10);

        let order_a: Vec<&str> = fused_a.iter().map(|c| c.chunk_id.as_str()).collect();
        let order_b: Vec<&str> = fused_b.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(order_a, order_b);
    }

    #[test]
    fn rrf_is_commutative_over_retrievers_with_balanced_weights() {
        let list_a = vec![point("x", 1.0), point("y", 0.5)];
        let list_b = vec![point("y", 1.0), point("x", 0.5)];

        let fused_1 = fuse(list_a.clone(), list_b.clone(), 0.5, 0.5, 60.0, 10);
        let fused_2 = fuse(list_b, list_a, 0.5, 0.5, 60.0, 10);

        let mut scores_1: Vec<(String, f64)> = fused_1.into_iter().map(|c| (c.chunk_id, c.score)).collect();
        let mut scores_2: Vec<(String, f64)> = fused_2.into_iter().map(|c| (c.chunk_id, c.score)).collect();
        scores_1.sort_by(|a, b| a.0.cmp(&b.0));
        scores_2.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(scores_1, scores_2);
    }

    #[test]
    fn weight_sensitivity_flips_top_result() {
        let sparse = vec![point("doc1", 10.0), point("doc3", 1.0)];
        let dense = vec![point("doc3", 10.0), point("doc1", 1.0)];

        let sparse_heavy = fuse(sparse.clone(), dense.clone(), 0.9, 0.1, 60.0, 10);
        assert_eq!(sparse_heavy[0].chunk_id, "doc1");

        let dense_heavy = fuse(sparse, dense, 0.1, 0.9, 60.0, 10);
        assert_eq!(dense_heavy[0].chunk_id, "doc3");
    }
}
