//! Multi-pass reranker (spec §4.8): a two-pass cross-encoder stage with
//! adaptive skip rules and early exit.

use crate::config::RerankConfig;
use crate::gateway::Gateway;
use crate::query_understanding::Intent;
use crate::retriever::FusedCandidate;

#[derive(Debug, Clone)]
pub struct RerankedCandidate {
    pub candidate: FusedCandidate,
    pub final_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub early_exit_after_pass1: bool,
    pub error: Option<String>,
}

pub struct RerankInput<'a> {
    pub query: &'a str,
    pub intent: Intent,
    pub exact_target_signal: bool,
    pub requested_top_k: usize,
}

/// Runs the two-pass rerank, or decides to skip per the configured rules.
/// On gateway failure, falls back to the fused order and records the error
/// in the outcome rather than failing the request.
pub async fn rerank(
    gateway: &Gateway,
    config: &RerankConfig,
    candidates: Vec<FusedCandidate>,
    input: RerankInput<'_>,
) -> (Vec<RerankedCandidate>, RerankOutcome) {
    if let Some(reason) = skip_reason(config, &candidates, &input) {
        let outcome = RerankOutcome { skipped: true, skip_reason: Some(reason), ..Default::default() };
        return (fused_as_final(candidates), outcome);
    }

    let pass1_pool: Vec<FusedCandidate> = candidates.iter().take(config.pass1_top_k).cloned().collect();
    let rest: Vec<FusedCandidate> = candidates.iter().skip(config.pass1_top_k).cloned().collect();

    let docs: Vec<String> = pass1_pool.iter().map(candidate_text).collect();
    let pass1_result = gateway.rerank(input.query, &docs, pass1_pool.len()).await;

    let pass1_scored = match pass1_result {
        Ok(scored) => scored,
        Err(e) => {
            let outcome = RerankOutcome { error: Some(e.to_string()), ..Default::default() };
            return (fused_as_final(candidates), outcome);
        }
    };

    let mut pass1_ranked: Vec<RerankedCandidate> = pass1_scored
        .into_iter()
        .map(|scored| RerankedCandidate { candidate: pass1_pool[scored.index].clone(), final_score: scored.score })
        .collect();
    pass1_ranked.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));

    let top_score = pass1_ranked.first().map(|c| c.final_score).unwrap_or(0.0);
    let kth_score = pass1_ranked.get(input.requested_top_k.saturating_sub(1)).map(|c| c.final_score).unwrap_or(0.0);
    let gap = top_score - kth_score;
    let satisfied = pass1_ranked.len() >= input.requested_top_k;

    if top_score >= config.high_confidence_threshold || (gap > config.margin && satisfied) {
        let mut out = pass1_ranked;
        out.extend(rest.into_iter().map(|c| RerankedCandidate { final_score: c.score, candidate: c }));
        let outcome = RerankOutcome { early_exit_after_pass1: true, ..Default::default() };
        return (out, outcome);
    }

    let pass2_pool: Vec<FusedCandidate> =
        pass1_ranked.iter().take(config.pass2_top_m).map(|c| c.candidate.clone()).collect();
    let pass2_docs: Vec<String> = pass2_pool.iter().map(candidate_text).collect();
    let pass2_result = gateway.rerank(input.query, &pass2_docs, pass2_pool.len()).await;

    let mut final_ranked = match pass2_result {
        Ok(scored) => scored
            .into_iter()
            .map(|scored| RerankedCandidate {
                candidate: pass2_pool[scored.index].clone(),
                final_score: scored.score,
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            let outcome = RerankOutcome { error: Some(e.to_string()), ..Default::default() };
            return (fused_as_final(candidates), outcome);
        }
    };
    final_ranked.sort_by(|a, b| b.final_score.partial_cmp(&a.final_score).unwrap_or(std::cmp::Ordering::Equal));

    let remaining_pass1: Vec<RerankedCandidate> = pass1_ranked.into_iter().skip(config.pass2_top_m).collect();
    final_ranked.extend(remaining_pass1);
    final_ranked.extend(rest.into_iter().map(|c| RerankedCandidate { final_score: c.score, candidate: c }));

    (final_ranked, RerankOutcome::default())
}

fn candidate_text(c: &FusedCandidate) -> String {
    c.payload.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn fused_as_final(candidates: Vec<FusedCandidate>) -> Vec<RerankedCandidate> {
    candidates.into_iter().map(|c| RerankedCandidate { final_score: c.score, candidate: c }).collect()
}

fn skip_reason(config: &RerankConfig, candidates: &[FusedCandidate], input: &RerankInput) -> Option<String> {
    if candidates.len() <= config.rerank_top_k {
        return Some("candidate-count-at-or-below-rerank-top-k".to_string());
    }
    if candidates.len() >= 6 {
        let top3: Vec<&str> = candidates[..3].iter().map(|c| c.chunk_id.as_str()).collect();
        let sparse_order: Vec<&str> = {
            let mut v: Vec<&FusedCandidate> = candidates.iter().filter(|c| c.sparse_rank.is_some()).collect();
            v.sort_by_key(|c| c.sparse_rank.unwrap());
            v.into_iter().take(3).map(|c| c.chunk_id.as_str()).collect()
        };
        let dense_order: Vec<&str> = {
            let mut v: Vec<&FusedCandidate> = candidates.iter().filter(|c| c.dense_rank.is_some()).collect();
            v.sort_by_key(|c| c.dense_rank.unwrap());
            v.into_iter().take(3).map(|c| c.chunk_id.as_str()).collect()
        };
        let agree = sparse_order.len() == 3 && dense_order.len() == 3 && sparse_order == top3 && dense_order == top3;
        let gap = candidates[0].score - candidates[1].score;
        if agree && gap >= config.margin {
            return Some("sparse-dense-agree-high-confidence".to_string());
        }
    }
    if input.intent == Intent::Navigational && input.exact_target_signal {
        return Some("navigational-exact-target".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use std::collections::HashMap;

    fn candidate(id: &str, score: f64, sparse_rank: Option<usize>, dense_rank: Option<usize>) -> FusedCandidate {
        FusedCandidate { chunk_id: id.to_string(), score, payload: HashMap::new(), sparse_rank, dense_rank }
    }

    #[test]
    fn skip_when_below_rerank_top_k() {
        let config = RerankConfig::default();
        let candidates = vec![candidate("a", 1.0, Some(1), Some(1))];
        let input = RerankInput { query: "q", intent: Intent::Factual, exact_target_signal: false, requested_top_k: 5 };
        assert!(skip_reason(&config, &candidates, &input).is_some());
    }

    #[test]
    fn skip_when_navigational_exact_target() {
        let config = RerankConfig::default();
        let candidates: Vec<FusedCandidate> = (0..20).map(|i| candidate(&format!("c{i}"), 1.0, Some(i + 1), Some(i + 1))).collect();
        let input =
            RerankInput { query: "q", intent: Intent::Navigational, exact_target_signal: true, requested_top_k: 5 };
        assert_eq!(skip_reason(&config, &candidates, &input), Some("navigational-exact-target".to_string()));
    }

    #[tokio::test]
    async fn falls_back_to_fused_order_when_skipped() {
        let gateway = Gateway::new(GatewayConfig::default(), "minilm");
        let config = RerankConfig::default();
        let candidates = vec![candidate("a", 0.9, Some(1), Some(1)), candidate("b", 0.5, Some(2), Some(2))];
        let input = RerankInput { query: "q", intent: Intent::Factual, exact_target_signal: false, requested_top_k: 5 };
        let (ranked, outcome) = rerank(&gateway, &config, candidates, input).await;
        assert!(outcome.skipped);
        assert_eq!(ranked[0].candidate.chunk_id, "a");
    }
}
