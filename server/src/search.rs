//! Hybrid search orchestration: ties query understanding, the gateway, the
//! retriever, the reranker, and the post-rank pipeline together into the one
//! operation every API surface (HTTP, gRPC, MCP) calls.

use std::time::Instant;

use codecortex_core::config::{validate_query_text, validate_top_k, validate_weight, SearchOptions};
use codecortex_core::document::DenseVector;
use codecortex_core::error::CoreResult;
use codecortex_core::gateway::Gateway;
use codecortex_core::postrank::{self, RankedResult};
use codecortex_core::query_understanding::{self, Strategy};
use codecortex_core::registry::ResolvedVersion;
use codecortex_core::reranker::{self, RerankInput};
use codecortex_core::retriever::{self, RetrievalRequest};
use codecortex_core::telemetry::{StageLatencies, TelemetryRecord};
use codecortex_core::vector_engine::VectorFilter;
use codecortex_core::Runtime;

pub struct SearchRequest {
    pub store: String,
    pub version: Option<String>,
    pub options: SearchOptions,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResultItem {
    pub chunk_id: String,
    pub path: String,
    pub score: f64,
    pub start_line: usize,
    pub end_line: usize,
    pub language: Option<String>,
    pub symbols: Vec<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResponse {
    pub request_id: String,
    pub store: String,
    pub version: String,
    pub strategy: String,
    pub intent: String,
    pub results: Vec<SearchResultItem>,
    pub took_ms: u128,
    pub rerank_skipped: bool,
    pub rerank_skip_reason: Option<String>,
}

fn strategy_weights(strategy: Strategy, options: &SearchOptions) -> (f64, f64) {
    if let (Some(s), Some(d)) = (options.sparse_weight, options.dense_weight) {
        return (s, d);
    }
    match strategy {
        Strategy::SparseOnly => (1.0, 0.0),
        Strategy::DenseOnly => (0.0, 1.0),
        Strategy::HybridBalanced => (0.5, 0.5),
        Strategy::HybridSparseHeavy => (0.7, 0.3),
        Strategy::HybridDenseHeavy => (0.3, 0.7),
    }
}

/// Runs one hybrid search end to end and records telemetry for it.
pub async fn search(runtime: &Runtime, request: SearchRequest) -> CoreResult<SearchResponse> {
    let start = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    validate_query_text(&request.options.query)?;
    validate_top_k(request.options.top_k)?;
    if let Some(w) = request.options.sparse_weight {
        validate_weight(w)?;
    }
    if let Some(w) = request.options.dense_weight {
        validate_weight(w)?;
    }

    let resolved: ResolvedVersion = runtime.registry.resolve(&request.store, request.version.as_deref())?;
    let analysis = query_understanding::understand(&request.options.query);
    let (sparse_weight, dense_weight) = strategy_weights(analysis.strategy, &request.options);

    let filter = VectorFilter {
        path_prefix: request.options.filter.as_ref().and_then(|f| f.path_prefix.clone()),
        languages: request.options.filter.as_ref().and_then(|f| f.languages.clone()),
        connection_id: request.connection_id.clone(),
    };

    let mut latencies = StageLatencies::default();

    let dense_query = if dense_weight > 0.0 {
        let t0 = Instant::now();
        let expanded = query_understanding::expand_dense(&analysis.normalized);
        let vec = runtime.gateway.embed(&[expanded]).await?.into_iter().next().unwrap();
        latencies.dense_ms = t0.elapsed().as_secs_f64() * 1000.0;
        Some(vec)
    } else {
        None
    };

    let sparse_query = if sparse_weight > 0.0 {
        let t0 = Instant::now();
        let expanded = query_understanding::flatten_weighted_tokens(&query_understanding::expand_sparse(&analysis.normalized));
        let vec = runtime.gateway.sparse_encode(&[expanded]).await?.into_iter().next().unwrap();
        latencies.sparse_ms = t0.elapsed().as_secs_f64() * 1000.0;
        Some(vec)
    } else {
        None
    };

    let prefetch_limit = (request.options.top_k * 5).max(100);
    let mut retrieval_request = RetrievalRequest::new(&resolved.dense_collection, prefetch_limit);
    retrieval_request.dense = dense_query.as_ref();
    retrieval_request.sparse = sparse_query.as_ref();
    retrieval_request.filter = filter;
    retrieval_request.sparse_weight = sparse_weight;
    retrieval_request.dense_weight = dense_weight;

    let t0 = Instant::now();
    // The reference engine co-locates both vector kinds in one collection
    // (see `retriever::retrieve`'s doc comment); the index pipeline only
    // ever creates and upserts into `dense_collection`, so both sides of
    // the query must target it too.
    let retrieval =
        retriever::retrieve(&runtime.engine, &resolved.dense_collection, &resolved.dense_collection, retrieval_request)
            .await?;
    latencies.fuse_ms = t0.elapsed().as_secs_f64() * 1000.0;
    let candidates_sparse = retrieval.sparse_count;
    let candidates_dense = retrieval.dense_count;
    let fused = retrieval.fused;
    let candidates_fused = fused.len();

    let enable_reranking = request.options.enable_reranking;
    let exact_target_signal = analysis.signals.has_path_like && fused.first().map(|c| c.sparse_rank == Some(1)).unwrap_or(false);

    let (ranked, outcome) = if enable_reranking {
        let t0 = Instant::now();
        let mut rerank_config = runtime.config.rerank.clone();
        if let Some(top_k) = request.options.rerank_top_k {
            rerank_config.rerank_top_k = top_k;
        }
        let input = RerankInput {
            query: &request.options.query,
            intent: analysis.intent,
            exact_target_signal,
            requested_top_k: request.options.top_k,
        };
        let (ranked, outcome) = reranker::rerank(&runtime.gateway, &rerank_config, fused, input).await;
        latencies.rerank_pass1_ms = t0.elapsed().as_secs_f64() * 1000.0;
        (ranked, outcome)
    } else {
        let ranked = fused
            .into_iter()
            .map(|c| codecortex_core::reranker::RerankedCandidate { final_score: c.score, candidate: c })
            .collect();
        (ranked, codecortex_core::reranker::RerankOutcome { skipped: true, skip_reason: Some("reranking-disabled".to_string()), ..Default::default() })
    };
    let candidates_reranked = ranked.len();

    let t0 = Instant::now();
    let ranked_results: Vec<RankedResult> = ranked
        .into_iter()
        .map(|r| {
            let embedding = r
                .candidate
                .payload
                .get("embedding")
                .and_then(|v| v.as_array())
                .map(|arr| DenseVector(arr.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect()))
                .unwrap_or_else(|| DenseVector(Vec::new()));
            let path = r.candidate.payload.get("path").and_then(|v| v.as_str()).unwrap_or("").to_string();
            RankedResult { chunk_id: r.candidate.chunk_id, path, score: r.final_score, embedding, payload: r.candidate.payload }
        })
        .collect();

    let mut post_config = runtime.config.post_rank.clone();
    post_config.group_by_file = request.options.group_by_file;
    if let Some(m) = request.options.max_per_file {
        post_config.max_per_file = m;
    }
    let (mut post_ranked, post_outcome) = postrank::run(ranked_results, &post_config, false);
    latencies.post_rank_ms = t0.elapsed().as_secs_f64() * 1000.0;
    let _ = post_outcome;
    post_ranked.truncate(request.options.top_k);

    let results: Vec<SearchResultItem> = post_ranked
        .into_iter()
        .map(|r| {
            let start_line = r.payload.get("start_line").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let end_line = r.payload.get("end_line").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let language = r.payload.get("language").and_then(|v| v.as_str()).map(|s| s.to_string());
            let symbols = r
                .payload
                .get("symbols")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|s| s.as_str().map(|s| s.to_string())).collect())
                .unwrap_or_default();
            let content = if request.options.include_content {
                r.payload.get("content").and_then(|v| v.as_str()).map(|s| s.to_string())
            } else {
                None
            };
            SearchResultItem { chunk_id: r.chunk_id, path: r.path, score: r.score, start_line, end_line, language, symbols, content }
        })
        .collect();

    let took_ms = start.elapsed().as_millis();
    let (cache_hit_embed, cache_hit_sparse) = runtime.gateway.cache_hit_rates();
    let record = TelemetryRecord {
        request_id: request_id.clone(),
        store: request.store.clone(),
        version: resolved.version.clone(),
        query: request.options.query.clone(),
        normalized_query: analysis.normalized.clone(),
        intent: format!("{:?}", analysis.intent).to_lowercase(),
        difficulty: format!("{:?}", analysis.difficulty).to_lowercase(),
        strategy: format!("{:?}", analysis.strategy).to_lowercase(),
        latencies,
        candidates_sparse,
        candidates_dense,
        candidates_fused,
        candidates_reranked,
        result_count: results.len(),
        cache_hit_embed: cache_hit_embed > 0.0,
        cache_hit_sparse: cache_hit_sparse > 0.0,
        rerank_enabled: enable_reranking,
        rerank_skipped: outcome.skipped,
        rerank_skip_reason: outcome.skip_reason.clone(),
        top_result_signature: results.first().map(|r| r.chunk_id.clone()),
        timestamp_ms: codecortex_core::util::unix_timestamp_ms(),
        extra: Default::default(),
    };
    runtime.telemetry.record(record);

    Ok(SearchResponse {
        request_id,
        store: request.store,
        version: resolved.version,
        strategy: format!("{:?}", analysis.strategy).to_lowercase(),
        intent: format!("{:?}", analysis.intent).to_lowercase(),
        results,
        took_ms,
        rerank_skipped: outcome.skipped,
        rerank_skip_reason: outcome.skip_reason,
    })
}
