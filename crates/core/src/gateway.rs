//! ML Capability Gateway (spec §4.3): a uniform front for `embed`,
//! `sparse_encode`, `rerank`, and `classify_query`, each backed by a
//! pluggable backend with caching, health reporting, and failure policy.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{CapabilityConfig, FailurePolicy, GatewayBackend, GatewayConfig};
use crate::document::{DenseVector, SparseVector};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityStatus {
    Loaded,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityHealth {
    pub status: CapabilityStatus,
    pub device: String,
    pub backend: GatewayBackend,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryClassification {
    pub intent: String,
    pub difficulty: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankedDoc {
    pub index: usize,
    pub score: f64,
}

/// Per-capability content-addressed cache with LRU eviction by insertion
/// order (a doubly-linked `VecDeque` of keys kept alongside the map).
struct CapabilityCache {
    capacity: usize,
    entries: DashMap<String, CachedValue>,
    order: std::sync::Mutex<std::collections::VecDeque<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone)]
enum CachedValue {
    Dense(DenseVector),
    Sparse(SparseVector),
}

impl CapabilityCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: DashMap::new(),
            order: std::sync::Mutex::new(std::collections::VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &str) -> Option<CachedValue> {
        match self.entries.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: String, value: CachedValue) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, value);
            return;
        }
        let mut order = self.order.lock().unwrap();
        if order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

fn cache_key(model_id: &str, text: &str) -> String {
    let normalized: String = text.trim().split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = DefaultHasher::new();
    model_id.hash(&mut hasher);
    normalized.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Trips after `threshold` consecutive failures; stays open for
/// `cooldown` before allowing a single probe call through.
struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { threshold, cooldown, consecutive_failures: AtomicU32::new(0), opened_at: RwLock::new(None) }
    }

    fn allow(&self) -> bool {
        match *self.opened_at.read().unwrap() {
            None => true,
            Some(opened) => opened.elapsed() >= self.cooldown,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.opened_at.write().unwrap() = None;
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            *self.opened_at.write().unwrap() = Some(Instant::now());
        }
    }
}

/// A process-local, growing vocabulary used by the stub sparse encoder so the
/// system is operational without any external model service.
struct StubVocabulary {
    ids: DashMap<String, u32>,
    next_id: AtomicU32,
}

impl StubVocabulary {
    fn new() -> Self {
        Self { ids: DashMap::new(), next_id: AtomicU32::new(0) }
    }

    fn id_for(&self, token: &str) -> u32 {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ids.entry(token.to_string()).or_insert(id);
        *self.ids.get(token).unwrap()
    }
}

struct Capability {
    config: CapabilityConfig,
    cache: CapabilityCache,
    breaker: CircuitBreaker,
    status: RwLock<CapabilityStatus>,
}

impl Capability {
    fn new(config: CapabilityConfig, cache_capacity: usize) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, Duration::from_secs(config.breaker_cooldown_secs));
        Self { config, cache: CapabilityCache::new(cache_capacity), breaker, status: RwLock::new(CapabilityStatus::Loaded) }
    }

    fn device(&self) -> &'static str {
        match self.config.backend {
            GatewayBackend::InProcessStub => "cpu",
            GatewayBackend::RemoteHttp => "remote",
            GatewayBackend::GpuAccelerated => "gpu",
        }
    }
}

/// Uniform gateway over the four ML capabilities (spec §4.3).
pub struct Gateway {
    embed_model_id: String,
    embed: Capability,
    sparse: Capability,
    rerank: Capability,
    classify: Capability,
    vocabulary: StubVocabulary,
    http: reqwest::Client,
}

impl Gateway {
    pub fn new(config: GatewayConfig, embed_model_id: impl Into<String>) -> Self {
        Self {
            embed_model_id: embed_model_id.into(),
            embed: Capability::new(config.embed, config.cache_capacity),
            sparse: Capability::new(config.sparse, config.cache_capacity),
            rerank: Capability::new(config.rerank, config.cache_capacity),
            classify: Capability::new(config.classify, config.cache_capacity),
            vocabulary: StubVocabulary::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn health(&self) -> HashMap<&'static str, CapabilityHealth> {
        let mut out = HashMap::new();
        out.insert(
            "embed",
            CapabilityHealth { status: *self.embed.status.read().unwrap(), device: self.embed.device().to_string(), backend: self.embed.config.backend },
        );
        out.insert(
            "sparse_encode",
            CapabilityHealth { status: *self.sparse.status.read().unwrap(), device: self.sparse.device().to_string(), backend: self.sparse.config.backend },
        );
        out.insert(
            "rerank",
            CapabilityHealth { status: *self.rerank.status.read().unwrap(), device: self.rerank.device().to_string(), backend: self.rerank.config.backend },
        );
        out.insert(
            "classify_query",
            CapabilityHealth { status: *self.classify.status.read().unwrap(), device: self.classify.device().to_string(), backend: self.classify.config.backend },
        );
        out
    }

    pub fn cache_hit_rates(&self) -> (f64, f64) {
        (self.embed.cache.hit_rate(), self.sparse.cache.hit_rate())
    }

    /// `embed(texts) -> dense[]`.
    pub async fn embed(&self, texts: &[String]) -> CoreResult<Vec<DenseVector>> {
        let mut out = Vec::with_capacity(texts.len());
        let mut misses: Vec<(usize, String)> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let key = cache_key(&self.embed_model_id, text);
            match self.embed.cache.get(&key) {
                Some(CachedValue::Dense(v)) => out.push(Some(v)),
                _ => {
                    out.push(None);
                    misses.push((i, key));
                }
            }
        }
        if misses.is_empty() {
            return Ok(out.into_iter().map(|v| v.unwrap()).collect());
        }
        if !self.embed.breaker.allow() {
            return self.handle_capability_failure(&self.embed, "embed backend circuit open");
        }
        let miss_texts: Vec<&String> = misses.iter().map(|(i, _)| &texts[*i]).collect();
        match self.call_embed_backend(&miss_texts).await {
            Ok(vectors) => {
                self.embed.breaker.record_success();
                for ((i, key), vector) in misses.into_iter().zip(vectors.into_iter()) {
                    self.embed.cache.put(key, CachedValue::Dense(vector.clone()));
                    out[i] = Some(vector);
                }
                Ok(out.into_iter().map(|v| v.unwrap()).collect())
            }
            Err(e) => {
                self.embed.breaker.record_failure();
                if self.embed.config.failure_policy == FailurePolicy::Fallback {
                    *self.embed.status.write().unwrap() = CapabilityStatus::Degraded;
                    let (indices, keys): (Vec<usize>, Vec<String>) = misses.into_iter().unzip();
                    for (i, key) in indices.into_iter().zip(keys) {
                        let vector = stub_embed(&texts[i], 384);
                        self.embed.cache.put(key, CachedValue::Dense(vector.clone()));
                        out[i] = Some(vector);
                    }
                    return Ok(out.into_iter().map(|v| v.unwrap()).collect());
                }
                self.handle_capability_failure_err(&self.embed, e)
            }
        }
    }

    async fn call_embed_backend(&self, texts: &[&String]) -> CoreResult<Vec<DenseVector>> {
        match self.embed.config.backend {
            GatewayBackend::InProcessStub | GatewayBackend::GpuAccelerated => {
                Ok(texts.iter().map(|t| stub_embed(t, 384)).collect())
            }
            GatewayBackend::RemoteHttp => {
                let url = self
                    .embed
                    .config
                    .remote_url
                    .as_deref()
                    .ok_or_else(|| CoreError::validation("remote-http embed backend requires remote_url"))?;
                let body = serde_json::json!({ "texts": texts });
                let resp = self
                    .http
                    .post(format!("{url}/embed"))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| CoreError::TransientExternal(format!("embed request failed: {e}")))?;
                let parsed: Vec<Vec<f32>> = resp
                    .json()
                    .await
                    .map_err(|e| CoreError::TransientExternal(format!("embed response decode failed: {e}")))?;
                Ok(parsed.into_iter().map(|v| DenseVector(v).normalize()).collect())
            }
        }
    }

    /// `sparse_encode(texts) -> sparse[]`, using a tokenized log-TF stub with
    /// a process-local growing vocabulary.
    pub async fn sparse_encode(&self, texts: &[String]) -> CoreResult<Vec<SparseVector>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let key = cache_key("sparse-stub", text);
            if let Some(CachedValue::Sparse(v)) = self.sparse.cache.get(&key) {
                out.push(v);
                continue;
            }
            let vector = self.stub_sparse_encode(text);
            self.sparse.cache.put(key, CachedValue::Sparse(vector.clone()));
            out.push(vector);
        }
        Ok(out)
    }

    fn stub_sparse_encode(&self, text: &str) -> SparseVector {
        let mut term_counts: HashMap<u32, u32> = HashMap::new();
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let id = self.vocabulary.id_for(token);
            *term_counts.entry(id).or_insert(0) += 1;
        }
        let mut indices = Vec::with_capacity(term_counts.len());
        let mut weights = Vec::with_capacity(term_counts.len());
        for (id, count) in term_counts {
            indices.push(id);
            weights.push((1.0 + (count as f32).ln()).max(0.0));
        }
        SparseVector { indices, weights }.truncate_top_k(256)
    }

    /// `rerank(query, docs, top_k) -> scored[]`. Never cached (query-dependent).
    pub async fn rerank(&self, query: &str, docs: &[String], top_k: usize) -> CoreResult<Vec<RerankedDoc>> {
        if !self.rerank.breaker.allow() {
            return self.handle_capability_failure(&self.rerank, "rerank backend circuit open");
        }
        let result = match self.rerank.config.backend {
            GatewayBackend::InProcessStub | GatewayBackend::GpuAccelerated => Ok(stub_rerank(query, docs)),
            GatewayBackend::RemoteHttp => {
                let url = self
                    .rerank
                    .config
                    .remote_url
                    .as_deref()
                    .ok_or_else(|| CoreError::validation("remote-http rerank backend requires remote_url"))?;
                let body = serde_json::json!({ "query": query, "docs": docs });
                self.http
                    .post(format!("{url}/rerank"))
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| CoreError::TransientExternal(format!("rerank request failed: {e}")))?
                    .json::<Vec<f64>>()
                    .await
                    .map(|scores| {
                        scores.into_iter().enumerate().map(|(index, score)| RerankedDoc { index, score }).collect()
                    })
                    .map_err(|e| CoreError::TransientExternal(format!("rerank response decode failed: {e}")))
            }
        };
        match result {
            Ok(mut scored) => {
                self.rerank.breaker.record_success();
                scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(top_k);
                Ok(scored)
            }
            Err(e) => {
                self.rerank.breaker.record_failure();
                if self.rerank.config.failure_policy == FailurePolicy::Fallback {
                    *self.rerank.status.write().unwrap() = CapabilityStatus::Degraded;
                    let mut scored = stub_rerank(query, docs);
                    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                    scored.truncate(top_k);
                    return Ok(scored);
                }
                self.handle_capability_failure_err(&self.rerank, e)
            }
        }
    }

    /// `classify_query(text) -> {intent, difficulty, confidence}`.
    /// Delegates to the query-understanding rules; the gateway's own
    /// classification capability exists for remote/GPU-backed classifiers.
    pub async fn classify_query(&self, text: &str) -> CoreResult<QueryClassification> {
        match self.classify.config.backend {
            GatewayBackend::InProcessStub | GatewayBackend::GpuAccelerated => {
                let analysis = crate::query_understanding::understand(text);
                Ok(QueryClassification {
                    intent: format!("{:?}", analysis.intent).to_lowercase(),
                    difficulty: format!("{:?}", analysis.difficulty).to_lowercase(),
                    confidence: analysis.confidence,
                })
            }
            GatewayBackend::RemoteHttp => {
                if !self.classify.breaker.allow() {
                    return self.handle_capability_failure(&self.classify, "classify backend circuit open");
                }
                let result: CoreResult<QueryClassification> = async {
                    let url = self
                        .classify
                        .config
                        .remote_url
                        .as_deref()
                        .ok_or_else(|| CoreError::validation("remote-http classify backend requires remote_url"))?;
                    let resp = self
                        .http
                        .post(format!("{url}/classify"))
                        .json(&serde_json::json!({ "text": text }))
                        .send()
                        .await
                        .map_err(|e| CoreError::TransientExternal(format!("classify request failed: {e}")))?;
                    resp.json()
                        .await
                        .map_err(|e| CoreError::TransientExternal(format!("classify response decode failed: {e}")))
                }
                .await;
                match result {
                    Ok(classification) => {
                        self.classify.breaker.record_success();
                        Ok(classification)
                    }
                    Err(e) => {
                        self.classify.breaker.record_failure();
                        if self.classify.config.failure_policy == FailurePolicy::Fallback {
                            *self.classify.status.write().unwrap() = CapabilityStatus::Degraded;
                            let analysis = crate::query_understanding::understand(text);
                            Ok(QueryClassification {
                                intent: format!("{:?}", analysis.intent).to_lowercase(),
                                difficulty: format!("{:?}", analysis.difficulty).to_lowercase(),
                                confidence: analysis.confidence,
                            })
                        } else {
                            self.handle_capability_failure_err(&self.classify, e)
                        }
                    }
                }
            }
        }
    }

    fn handle_capability_failure<T>(&self, capability: &Capability, message: &str) -> CoreResult<T> {
        *capability.status.write().unwrap() = CapabilityStatus::Unavailable;
        Err(CoreError::TransientExternal(message.to_string()))
    }

    fn handle_capability_failure_err<T>(&self, capability: &Capability, err: CoreError) -> CoreResult<T> {
        match capability.config.failure_policy {
            FailurePolicy::Error | FailurePolicy::CircuitBreaker => {
                *capability.status.write().unwrap() = CapabilityStatus::Degraded;
                Err(err)
            }
            FailurePolicy::Fallback => {
                *capability.status.write().unwrap() = CapabilityStatus::Degraded;
                Err(err)
            }
        }
    }
}

fn stub_embed(text: &str, dim: usize) -> DenseVector {
    let mut values = vec![0.0f32; dim];
    let mut hasher = DefaultHasher::new();
    for (i, token) in text.to_lowercase().split_whitespace().enumerate() {
        token.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h as usize) % dim;
        values[idx] += 1.0 / (1.0 + i as f32);
    }
    DenseVector(values).normalize()
}

fn stub_rerank(query: &str, docs: &[String]) -> Vec<RerankedDoc> {
    let query_terms: std::collections::HashSet<String> =
        query.to_lowercase().split_whitespace().map(|s| s.to_string()).collect();
    docs.iter()
        .enumerate()
        .map(|(index, doc)| {
            let doc_terms: std::collections::HashSet<String> =
                doc.to_lowercase().split_whitespace().map(|s| s.to_string()).collect();
            let overlap = query_terms.intersection(&doc_terms).count();
            let score = overlap as f64 / (query_terms.len().max(1) as f64);
            RerankedDoc { index, score }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    #[tokio::test]
    async fn embed_caches_repeated_text() {
        let gateway = Gateway::new(GatewayConfig::default(), "minilm");
        let texts = vec!["fn main() {}".to_string()];
        let first = gateway.embed(&texts).await.unwrap();
        let second = gateway.embed(&texts).await.unwrap();
        assert_eq!(first[0].0, second[0].0);
        let (embed_hit_rate, _) = gateway.cache_hit_rates();
        assert!(embed_hit_rate > 0.0);
    }

    #[tokio::test]
    async fn sparse_encode_is_deterministic() {
        let gateway = Gateway::new(GatewayConfig::default(), "minilm");
        let texts = vec!["hello world hello".to_string()];
        let a = gateway.sparse_encode(&texts).await.unwrap();
        let b = gateway.sparse_encode(&texts).await.unwrap();
        assert_eq!(a[0].indices, b[0].indices);
        assert_eq!(a[0].weights, b[0].weights);
    }

    #[tokio::test]
    async fn rerank_orders_by_overlap() {
        let gateway = Gateway::new(GatewayConfig::default(), "minilm");
        let docs = vec!["completely unrelated text".to_string(), "hello world example".to_string()];
        let scored = gateway.rerank("hello world", &docs, 2).await.unwrap();
        assert_eq!(scored[0].index, 1);
    }
}
