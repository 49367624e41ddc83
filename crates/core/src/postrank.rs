//! Post-rank pipeline (spec §4.9): dedup, MMR diversity, then optional
//! per-file aggregation, always in that fixed order.

use std::collections::HashMap;

use crate::config::PostRankConfig;
use crate::document::DenseVector;

#[derive(Debug, Clone)]
pub struct RankedResult {
    pub chunk_id: String,
    pub path: String,
    pub score: f64,
    pub embedding: DenseVector,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct PostRankOutcome {
    pub partial: bool,
    pub avg_diversity: f64,
}

/// Runs dedup -> diversity -> aggregation in fixed order, honoring `deadline`
/// as a results-returned-so-far budget (the in-process port has no
/// meaningful async suspension per item, so the deadline only bounds whether
/// we consider the output complete).
pub fn run(results: Vec<RankedResult>, config: &PostRankConfig, deadline_exceeded: bool) -> (Vec<RankedResult>, PostRankOutcome) {
    let deduped = if config.enable_dedup {
        dedup(results, config.dedup_threshold, config.preserve_top, config.prefer_longer)
    } else {
        results
    };

    let (diversified, avg_diversity) = if config.enable_diversity {
        diversify(deduped, config.diversity_lambda)
    } else {
        (deduped, 0.0)
    };

    let aggregated = if config.group_by_file {
        aggregate(diversified, config.max_per_file)
    } else {
        diversified
    };

    (aggregated, PostRankOutcome { partial: deadline_exceeded, avg_diversity })
}

/// Pairwise cosine-similarity dedup, stable order, always preserving the
/// top-K candidates regardless of similarity.
pub fn dedup(results: Vec<RankedResult>, threshold: f32, preserve_top: usize, prefer_longer: bool) -> Vec<RankedResult> {
    let mut kept: Vec<RankedResult> = Vec::new();
    for (i, candidate) in results.into_iter().enumerate() {
        if i < preserve_top {
            kept.push(candidate);
            continue;
        }
        let mut replace_at: Option<usize> = None;
        let mut is_duplicate = false;
        for (ki, k) in kept.iter().enumerate() {
            let sim = candidate.embedding.cosine(&k.embedding);
            if sim >= threshold {
                is_duplicate = true;
                if prefer_longer {
                    let candidate_len = candidate.payload.get("content").and_then(|v| v.as_str()).map(|s| s.len()).unwrap_or(0);
                    let kept_len = k.payload.get("content").and_then(|v| v.as_str()).map(|s| s.len()).unwrap_or(0);
                    if candidate_len > kept_len {
                        replace_at = Some(ki);
                    }
                }
                break;
            }
        }
        if let Some(idx) = replace_at {
            kept[idx] = candidate;
        } else if !is_duplicate {
            kept.push(candidate);
        }
    }
    kept
}

/// Idempotent by construction: a second pass over already-deduplicated
/// output finds no pair at or above `threshold` (every kept candidate was
/// already below threshold against every other kept candidate), so nothing
/// new is dropped.
pub fn diversify(results: Vec<RankedResult>, lambda: f32) -> (Vec<RankedResult>, f64) {
    if results.is_empty() {
        return (results, 0.0);
    }
    let max_score = results.iter().map(|r| r.score).fold(f64::MIN, f64::max).max(1e-9);
    let min_score = results.iter().map(|r| r.score).fold(f64::MAX, f64::min);
    let range = (max_score - min_score).max(1e-9);
    let normalized_rel: Vec<f32> = results.iter().map(|r| ((r.score - min_score) / range) as f32).collect();

    let first = (0..results.len())
        .max_by(|&a, &b| results[a].score.partial_cmp(&results[b].score).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap();
    let mut remaining: Vec<usize> = (0..results.len()).filter(|&i| i != first).collect();
    let mut selected: Vec<usize> = vec![first];
    let mut diversities = Vec::new();

    while !remaining.is_empty() {
        let mut best_idx = 0usize;
        let mut best_value = f32::MIN;
        let mut best_max_sim = 0.0f32;
        for (ri, &i) in remaining.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|&j| results[i].embedding.cosine(&results[j].embedding))
                .fold(f32::MIN, f32::max);
            let value = lambda * normalized_rel[i] - (1.0 - lambda) * max_sim;
            if value > best_value {
                best_value = value;
                best_idx = ri;
                best_max_sim = max_sim;
            }
        }
        let chosen = remaining.remove(best_idx);
        diversities.push(1.0 - best_max_sim.max(0.0) as f64);
        selected.push(chosen);
    }

    let avg_diversity = if diversities.is_empty() { 1.0 } else { diversities.iter().sum::<f64>() / diversities.len() as f64 };
    let ordered: Vec<RankedResult> = selected.into_iter().map(|i| results[i].clone()).collect();
    (ordered, avg_diversity)
}

/// Groups by `path`, keeps top-M per file by score, and computes a
/// weighted-mean `file_score` with weights `2^-i`. Representatives (rank-1
/// chunk per file) are ordered by `file_score` first, then non-representatives
/// by their own score.
pub fn aggregate(results: Vec<RankedResult>, max_per_file: usize) -> Vec<RankedResult> {
    let mut by_path: HashMap<String, Vec<RankedResult>> = HashMap::new();
    let order: Vec<String> = {
        let mut seen = Vec::new();
        for r in &results {
            if !seen.contains(&r.path) {
                seen.push(r.path.clone());
            }
        }
        seen
    };
    for r in results {
        by_path.entry(r.path.clone()).or_default().push(r);
    }

    let mut representatives: Vec<(f64, RankedResult)> = Vec::new();
    let mut non_representatives: Vec<RankedResult> = Vec::new();

    for path in order {
        let mut group = by_path.remove(&path).unwrap();
        group.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        group.truncate(max_per_file.max(1));
        let file_score: f64 =
            group.iter().enumerate().map(|(i, r)| r.score * 2f64.powi(-(i as i32))).sum::<f64>()
                / group.iter().enumerate().map(|(i, _)| 2f64.powi(-(i as i32))).sum::<f64>();
        let mut iter = group.into_iter();
        if let Some(top) = iter.next() {
            representatives.push((file_score, top));
        }
        non_representatives.extend(iter);
    }

    representatives.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    non_representatives.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut out: Vec<RankedResult> = representatives.into_iter().map(|(_, r)| r).collect();
    out.extend(non_representatives);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, path: &str, score: f64, embedding: Vec<f32>) -> RankedResult {
        RankedResult {
            chunk_id: id.to_string(),
            path: path.to_string(),
            score,
            embedding: DenseVector(embedding).normalize(),
            payload: HashMap::new(),
        }
    }

    #[test]
    fn dedup_drops_near_duplicate_preserving_order() {
        let results = vec![
            result("a", "x.rs", 0.9, vec![1.0, 0.0]),
            result("b", "x.rs", 0.8, vec![0.999, 0.001]),
            result("c", "y.rs", 0.5, vec![0.0, 1.0]),
        ];
        let deduped = dedup(results, 0.85, 0, false);
        let ids: Vec<&str> = deduped.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn dedup_is_idempotent() {
        let results = vec![
            result("a", "x.rs", 0.9, vec![1.0, 0.0]),
            result("b", "x.rs", 0.8, vec![0.999, 0.001]),
            result("c", "y.rs", 0.5, vec![0.0, 1.0]),
        ];
        let once = dedup(results, 0.85, 0, false);
        let twice = dedup(once.clone(), 0.85, 0, false);
        let ids_once: Vec<&str> = once.iter().map(|r| r.chunk_id.as_str()).collect();
        let ids_twice: Vec<&str> = twice.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids_once, ids_twice);
    }

    #[test]
    fn preserve_top_keeps_even_near_duplicates() {
        let results = vec![
            result("a", "x.rs", 0.9, vec![1.0, 0.0]),
            result("b", "x.rs", 0.8, vec![0.999, 0.001]),
        ];
        let deduped = dedup(results, 0.85, 2, false);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn diversify_first_pick_is_highest_scoring() {
        let results = vec![
            result("a", "x.rs", 0.9, vec![1.0, 0.0]),
            result("b", "y.rs", 0.95, vec![0.0, 1.0]),
        ];
        let (ordered, _) = diversify(results, 0.7);
        assert_eq!(ordered[0].chunk_id, "b");
    }

    #[test]
    fn aggregate_orders_representatives_by_file_score() {
        let results = vec![
            result("a1", "a.rs", 0.5, vec![1.0, 0.0]),
            result("a2", "a.rs", 0.4, vec![1.0, 0.0]),
            result("b1", "b.rs", 0.9, vec![0.0, 1.0]),
        ];
        let aggregated = aggregate(results, 3);
        assert_eq!(aggregated[0].chunk_id, "b1");
        assert_eq!(aggregated[1].chunk_id, "a1");
    }
}
