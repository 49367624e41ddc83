//! Evaluation & telemetry (spec §4.10): per-request records, per-store
//! aggregates, Prometheus export, rotating query log, IR metrics, A/B compare.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::document::Extra;
use crate::error::CoreResult;
use crate::util::{today_partition, unix_timestamp_ms};

// ---------------------------------------------------------------------------
// Telemetry record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLatencies {
    pub sparse_ms: f64,
    pub dense_ms: f64,
    pub fuse_ms: f64,
    pub rerank_pass1_ms: f64,
    pub rerank_pass2_ms: f64,
    pub post_rank_ms: f64,
}

impl Default for StageLatencies {
    fn default() -> Self {
        Self { sparse_ms: 0.0, dense_ms: 0.0, fuse_ms: 0.0, rerank_pass1_ms: 0.0, rerank_pass2_ms: 0.0, post_rank_ms: 0.0 }
    }
}

impl StageLatencies {
    pub fn total_ms(&self) -> f64 {
        self.sparse_ms.max(self.dense_ms)
            + self.fuse_ms
            + self.rerank_pass1_ms
            + self.rerank_pass2_ms
            + self.post_rank_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub request_id: String,
    pub store: String,
    pub version: String,
    pub query: String,
    pub normalized_query: String,
    pub intent: String,
    pub difficulty: String,
    pub strategy: String,
    pub latencies: StageLatencies,
    pub candidates_sparse: usize,
    pub candidates_dense: usize,
    pub candidates_fused: usize,
    pub candidates_reranked: usize,
    pub result_count: usize,
    pub cache_hit_embed: bool,
    pub cache_hit_sparse: bool,
    pub rerank_enabled: bool,
    pub rerank_skipped: bool,
    pub rerank_skip_reason: Option<String>,
    pub top_result_signature: Option<String>,
    pub timestamp_ms: u128,
    #[serde(default)]
    pub extra: Extra,
}

// ---------------------------------------------------------------------------
// Query log entry (durable subset, spec §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryLogEntry {
    pub request_id: String,
    pub store: String,
    pub query: String,
    pub intent: String,
    pub strategy: String,
    pub result_count: usize,
    pub total_latency_ms: f64,
    pub timestamp_ms: u128,
}

impl From<&TelemetryRecord> for QueryLogEntry {
    fn from(r: &TelemetryRecord) -> Self {
        Self {
            request_id: r.request_id.clone(),
            store: r.store.clone(),
            query: r.query.clone(),
            intent: r.intent.clone(),
            strategy: r.strategy.clone(),
            result_count: r.result_count,
            total_latency_ms: r.latencies.total_ms(),
            timestamp_ms: r.timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Rotating JSONL writer, shared by the query log and the event-log wrapper
// ---------------------------------------------------------------------------

pub struct RotatingWriter {
    dir: PathBuf,
    prefix: String,
    rotate_bytes: u64,
    state: Mutex<WriterState>,
}

struct WriterState {
    file: Option<File>,
    current_path: PathBuf,
    written_bytes: u64,
}

impl RotatingWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, rotate_bytes: u64) -> CoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| crate::error::CoreError::Internal(format!("failed to create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            rotate_bytes,
            state: Mutex::new(WriterState { file: None, current_path: PathBuf::new(), written_bytes: 0 }),
        })
    }

    fn path_for(&self, partition: &str, seq: u32) -> PathBuf {
        if seq == 0 {
            self.dir.join(format!("{partition}.jsonl"))
        } else {
            self.dir.join(format!("{partition}.{seq}.jsonl"))
        }
    }

    pub fn append_line(&self, line: &str) -> CoreResult<()> {
        let partition = today_partition();
        let mut st = self.state.lock().unwrap();

        let needs_new_file = st.file.is_none()
            || !st.current_path.to_string_lossy().contains(&partition)
            || st.written_bytes + line.len() as u64 + 1 > self.rotate_bytes;

        if needs_new_file {
            let mut seq = 0;
            let mut path = self.path_for(&partition, seq);
            while path.exists()
                && std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) + line.len() as u64 + 1
                    > self.rotate_bytes
            {
                seq += 1;
                path = self.path_for(&partition, seq);
            }
            let existing_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let file = OpenOptions::new().create(true).append(true).open(&path).map_err(|e| {
                crate::error::CoreError::Internal(format!("failed to open {}: {e}", path.display()))
            })?;
            st.file = Some(file);
            st.current_path = path;
            st.written_bytes = existing_len;
        }

        if let Some(file) = st.file.as_mut() {
            writeln!(file, "{line}")
                .map_err(|e| crate::error::CoreError::Internal(format!("write failed: {e}")))?;
            st.written_bytes += line.len() as u64 + 1;
        }
        Ok(())
    }

    /// Synchronously flush buffered writes (called on shutdown).
    pub fn flush(&self) -> CoreResult<()> {
        let mut st = self.state.lock().unwrap();
        if let Some(file) = st.file.as_mut() {
            file.flush().map_err(|e| crate::error::CoreError::Internal(format!("flush failed: {e}")))?;
        }
        Ok(())
    }
}

/// Per-store rotating query log under `{data_dir}/query-logs/{store}/{date}.jsonl`.
pub struct QueryLog {
    data_dir: PathBuf,
    rotate_bytes: u64,
    writers: RwLock<BTreeMap<String, std::sync::Arc<RotatingWriter>>>,
}

impl QueryLog {
    pub fn new(data_dir: impl Into<PathBuf>, rotate_bytes: u64) -> Self {
        Self { data_dir: data_dir.into(), rotate_bytes, writers: RwLock::new(BTreeMap::new()) }
    }

    fn writer_for(&self, store: &str) -> CoreResult<std::sync::Arc<RotatingWriter>> {
        if let Some(w) = self.writers.read().unwrap().get(store) {
            return Ok(w.clone());
        }
        let mut writers = self.writers.write().unwrap();
        if let Some(w) = writers.get(store) {
            return Ok(w.clone());
        }
        let dir = self.data_dir.join("query-logs").join(store);
        let w = std::sync::Arc::new(RotatingWriter::new(dir, "query-log", self.rotate_bytes)?);
        writers.insert(store.to_string(), w.clone());
        Ok(w)
    }

    pub fn append(&self, record: &TelemetryRecord) -> CoreResult<()> {
        let entry = QueryLogEntry::from(record);
        let line = serde_json::to_string(&entry)
            .map_err(|e| crate::error::CoreError::Internal(format!("serialize failed: {e}")))?;
        self.writer_for(&record.store)?.append_line(&line)
    }

    pub fn flush_all(&self) -> CoreResult<()> {
        for w in self.writers.read().unwrap().values() {
            w.flush()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pluggable telemetry persistence backend (spec §4.10 "optional persistence
// backend (e.g., Redis) is pluggable")
// ---------------------------------------------------------------------------

/// A sink a `Telemetry` instance mirrors every record into, in addition to
/// the in-memory ring. Failures are logged and never propagated to the
/// request path — telemetry persistence is best-effort.
pub trait TelemetrySink: Send + Sync {
    fn push(&self, record: &TelemetryRecord);
}

#[cfg(feature = "redis-telemetry")]
pub struct RedisSink {
    client: redis::Client,
    key_prefix: String,
}

#[cfg(feature = "redis-telemetry")]
impl RedisSink {
    pub fn new(url: &str, key_prefix: impl Into<String>) -> CoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| crate::error::CoreError::validation(format!("invalid redis url: {e}")))?;
        Ok(Self { client, key_prefix: key_prefix.into() })
    }
}

#[cfg(feature = "redis-telemetry")]
impl TelemetrySink for RedisSink {
    fn push(&self, record: &TelemetryRecord) {
        let client = self.client.clone();
        let key = format!("{}:{}", self.key_prefix, record.store);
        let payload = match serde_json::to_string(record) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize telemetry record for redis sink");
                return;
            }
        };
        tokio::spawn(async move {
            let mut conn = match client.get_multiplexed_async_connection().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "redis telemetry sink: connection failed");
                    return;
                }
            };
            use redis::AsyncCommands;
            if let Err(e) = conn.lpush::<_, _, ()>(&key, payload).await {
                tracing::error!(error = %e, "redis telemetry sink: lpush failed");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Bounded ring buffer + per-store aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreAggregate {
    pub total: u64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub rerank_skip_rate: f64,
    pub intent_counts: BTreeMap<String, u64>,
    pub strategy_counts: BTreeMap<String, u64>,
}

pub struct Telemetry {
    ring: RwLock<VecDeque<TelemetryRecord>>,
    capacity: usize,
    query_log: Option<QueryLog>,
    sink: Option<std::sync::Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new(capacity: usize, query_log: Option<QueryLog>) -> Self {
        Self { ring: RwLock::new(VecDeque::with_capacity(capacity)), capacity, query_log, sink: None }
    }

    pub fn with_sink(mut self, sink: std::sync::Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn record(&self, record: TelemetryRecord) {
        if let Some(log) = &self.query_log {
            if let Err(e) = log.append(&record) {
                tracing::error!(error = %e, "failed to append query log entry");
            }
        }
        if let Some(sink) = &self.sink {
            sink.push(&record);
        }
        let mut ring = self.ring.write().unwrap();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn recent(&self, n: usize) -> Vec<TelemetryRecord> {
        let ring = self.ring.read().unwrap();
        ring.iter().rev().take(n).cloned().collect()
    }

    pub fn aggregate(&self, store: &str) -> StoreAggregate {
        let ring = self.ring.read().unwrap();
        let records: Vec<&TelemetryRecord> = ring.iter().filter(|r| r.store == store).collect();
        if records.is_empty() {
            return StoreAggregate::default();
        }
        let mut latencies: Vec<f64> = records.iter().map(|r| r.latencies.total_ms()).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let total = records.len();
        let avg = latencies.iter().sum::<f64>() / total as f64;
        let cache_hits = records.iter().filter(|r| r.cache_hit_embed || r.cache_hit_sparse).count();
        let skips = records.iter().filter(|r| r.rerank_skipped).count();
        let mut intent_counts = BTreeMap::new();
        let mut strategy_counts = BTreeMap::new();
        for r in &records {
            *intent_counts.entry(r.intent.clone()).or_insert(0u64) += 1;
            *strategy_counts.entry(r.strategy.clone()).or_insert(0u64) += 1;
        }
        StoreAggregate {
            total: total as u64,
            avg_latency_ms: avg,
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            p99_latency_ms: percentile(&latencies, 0.99),
            cache_hit_rate: cache_hits as f64 / total as f64,
            rerank_skip_rate: skips as f64 / total as f64,
            intent_counts,
            strategy_counts,
        }
    }

    pub fn stores(&self) -> Vec<String> {
        let ring = self.ring.read().unwrap();
        let mut set: Vec<String> = ring.iter().map(|r| r.store.clone()).collect();
        set.sort();
        set.dedup();
        set
    }

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP codecortex_requests_total Total search requests served\n");
        out.push_str("# TYPE codecortex_requests_total counter\n");
        for store in self.stores() {
            let agg = self.aggregate(&store);
            out.push_str(&format!("codecortex_requests_total{{store=\"{store}\"}} {}\n", agg.total));
            out.push_str(&format!(
                "codecortex_latency_ms_p50{{store=\"{store}\"}} {}\n",
                agg.p50_latency_ms
            ));
            out.push_str(&format!(
                "codecortex_latency_ms_p95{{store=\"{store}\"}} {}\n",
                agg.p95_latency_ms
            ));
            out.push_str(&format!(
                "codecortex_latency_ms_p99{{store=\"{store}\"}} {}\n",
                agg.p99_latency_ms
            ));
            out.push_str(&format!(
                "codecortex_cache_hit_rate{{store=\"{store}\"}} {}\n",
                agg.cache_hit_rate
            ));
            out.push_str(&format!(
                "codecortex_rerank_skip_rate{{store=\"{store}\"}} {}\n",
                agg.rerank_skip_rate
            ));
        }
        out
    }

    pub fn flush_query_log(&self) -> CoreResult<()> {
        if let Some(log) = &self.query_log {
            log.flush_all()?;
        }
        Ok(())
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// ---------------------------------------------------------------------------
// IR metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Judgment {
    pub query_id: String,
    pub doc_id: String,
    pub grade: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub query_id: String,
    pub ndcg: f64,
    pub ndcg_5: f64,
    pub ndcg_10: f64,
    pub recall: f64,
    pub recall_5: f64,
    pub recall_10: f64,
    pub mrr: f64,
    pub precision_5: f64,
    pub precision_10: f64,
    pub average_precision: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub mean_ndcg: f64,
    pub mean_ndcg_10: f64,
    pub mean_recall: f64,
    pub mean_mrr: f64,
    pub mean_average_precision: f64,
    pub queries_with_no_relevant: u64,
    pub queries_with_perfect_recall: u64,
    pub query_count: u64,
}

fn dcg(grades: &[u8], k: usize) -> f64 {
    grades
        .iter()
        .take(k)
        .enumerate()
        .map(|(i, &g)| {
            let rank = i + 1;
            (2f64.powi(g as i32) - 1.0) / ((rank as f64 + 1.0).log2())
        })
        .sum()
}

/// Compute all per-query IR metrics for one ranked result list against judgments.
pub fn compute_query_metrics(
    query_id: &str,
    ranked_doc_ids: &[String],
    judgments: &[Judgment],
) -> QueryMetrics {
    let grades: BTreeMap<&str, u8> = judgments
        .iter()
        .filter(|j| j.query_id == query_id)
        .map(|j| (j.doc_id.as_str(), j.grade))
        .collect();

    let ranked_grades: Vec<u8> =
        ranked_doc_ids.iter().map(|d| grades.get(d.as_str()).copied().unwrap_or(0)).collect();

    let mut ideal_grades: Vec<u8> = grades.values().copied().collect();
    ideal_grades.sort_by(|a, b| b.cmp(a));

    let ndcg_at = |k: usize| {
        let idcg = dcg(&ideal_grades, k);
        if idcg <= 0.0 {
            0.0
        } else {
            dcg(&ranked_grades, k) / idcg
        }
    };

    let relevant_total = grades.values().filter(|&&g| g > 0).count();
    let recall_at = |k: usize| {
        if relevant_total == 0 {
            0.0
        } else {
            ranked_grades.iter().take(k).filter(|&&g| g > 0).count() as f64 / relevant_total as f64
        }
    };

    let mrr = ranked_grades
        .iter()
        .position(|&g| g > 0)
        .map(|pos| 1.0 / (pos as f64 + 1.0))
        .unwrap_or(0.0);

    let precision_at = |k: usize| {
        let denom = k.min(ranked_grades.len());
        if denom == 0 {
            0.0
        } else {
            ranked_grades.iter().take(k).filter(|&&g| g > 0).count() as f64 / denom as f64
        }
    };

    let average_precision = if relevant_total == 0 {
        0.0
    } else {
        let mut hits = 0usize;
        let mut sum_precision = 0.0;
        for (i, &g) in ranked_grades.iter().enumerate() {
            if g > 0 {
                hits += 1;
                sum_precision += hits as f64 / (i as f64 + 1.0);
            }
        }
        sum_precision / relevant_total as f64
    };

    QueryMetrics {
        query_id: query_id.to_string(),
        ndcg: ndcg_at(ranked_grades.len().max(1)),
        ndcg_5: ndcg_at(5),
        ndcg_10: ndcg_at(10),
        recall: recall_at(ranked_grades.len().max(1)),
        recall_5: recall_at(5),
        recall_10: recall_at(10),
        mrr,
        precision_5: precision_at(5),
        precision_10: precision_at(10),
        average_precision,
    }
}

pub fn summarize(metrics: &[QueryMetrics]) -> MetricsSummary {
    if metrics.is_empty() {
        return MetricsSummary::default();
    }
    let n = metrics.len() as f64;
    MetricsSummary {
        mean_ndcg: metrics.iter().map(|m| m.ndcg).sum::<f64>() / n,
        mean_ndcg_10: metrics.iter().map(|m| m.ndcg_10).sum::<f64>() / n,
        mean_recall: metrics.iter().map(|m| m.recall).sum::<f64>() / n,
        mean_mrr: metrics.iter().map(|m| m.mrr).sum::<f64>() / n,
        mean_average_precision: metrics.iter().map(|m| m.average_precision).sum::<f64>() / n,
        queries_with_no_relevant: metrics.iter().filter(|m| m.recall == 0.0 && m.mrr == 0.0).count() as u64,
        queries_with_perfect_recall: metrics.iter().filter(|m| m.recall >= 1.0).count() as u64,
        query_count: metrics.len() as u64,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AbComparison {
    pub winner: Option<String>,
    pub ndcg_delta: f64,
    pub confidence: f64,
}

/// Compare two experiment arms by mean NDCG; winner needs a >1% relative lead.
pub fn compare_ab(name_a: &str, metrics_a: &[QueryMetrics], name_b: &str, metrics_b: &[QueryMetrics]) -> AbComparison {
    let summary_a = summarize(metrics_a);
    let summary_b = summarize(metrics_b);
    let delta = summary_b.mean_ndcg - summary_a.mean_ndcg;
    let threshold = 0.01;
    let winner = if summary_a.mean_ndcg.max(summary_b.mean_ndcg) <= 0.0 {
        None
    } else if delta.abs() / summary_a.mean_ndcg.max(1e-9) >= threshold {
        Some(if delta > 0.0 { name_b.to_string() } else { name_a.to_string() })
    } else {
        None
    };
    let confidence = (metrics_a.len().min(metrics_b.len()) as f64 / 100.0).min(1.0);
    AbComparison { winner, ndcg_delta: delta, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_log_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = QueryLog::new(dir.path(), 1024 * 1024);
        let record = TelemetryRecord {
            request_id: "r1".into(),
            store: "demo".into(),
            version: "v1".into(),
            query: "hello".into(),
            normalized_query: "hello".into(),
            intent: "factual".into(),
            difficulty: "easy".into(),
            strategy: "hybrid-balanced".into(),
            latencies: StageLatencies::default(),
            candidates_sparse: 10,
            candidates_dense: 10,
            candidates_fused: 15,
            candidates_reranked: 5,
            result_count: 5,
            cache_hit_embed: false,
            cache_hit_sparse: false,
            rerank_enabled: true,
            rerank_skipped: false,
            rerank_skip_reason: None,
            top_result_signature: Some("abc".into()),
            timestamp_ms: unix_timestamp_ms(),
            extra: Default::default(),
        };
        log.append(&record).unwrap();
        log.flush_all().unwrap();

        let partition = today_partition();
        let path: PathBuf = dir.path().join("query-logs/demo").join(format!("{partition}.jsonl"));
        let content = std::fs::read_to_string(&path).unwrap();
        let line = content.lines().next().unwrap();
        let parsed: QueryLogEntry = serde_json::from_str(line).unwrap();
        assert_eq!(parsed, QueryLogEntry::from(&record));
    }

    #[test]
    fn ndcg_of_perfect_ranking_is_one() {
        let judgments = vec![
            Judgment { query_id: "q1".into(), doc_id: "a".into(), grade: 3 },
            Judgment { query_id: "q1".into(), doc_id: "b".into(), grade: 2 },
            Judgment { query_id: "q1".into(), doc_id: "c".into(), grade: 0 },
        ];
        let ranked = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let m = compute_query_metrics("q1", &ranked, &judgments);
        assert!((m.ndcg - 1.0).abs() < 1e-9);
        assert_eq!(m.mrr, 1.0);
    }

    #[test]
    fn ab_compare_requires_threshold() {
        let a = vec![QueryMetrics {
            query_id: "q".into(), ndcg: 0.5, ndcg_5: 0.5, ndcg_10: 0.5, recall: 1.0, recall_5: 1.0,
            recall_10: 1.0, mrr: 1.0, precision_5: 1.0, precision_10: 1.0, average_precision: 1.0,
        }; 50];
        let mut b = a.clone();
        for m in b.iter_mut() {
            m.ndcg = 0.501;
        }
        let cmp = compare_ab("a", &a, "b", &b);
        assert!(cmp.winner.is_none(), "tiny delta should not declare a winner");
    }
}
