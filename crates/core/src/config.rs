//! Typed startup configuration.
//!
//! Loaded from `{data_dir}/config.toml` (or a path given with `--config`) and
//! merged with CLI flags at the call site. Every struct rejects unknown keys
//! at parse time — config objects with dozens of options are enumerated
//! explicitly rather than passed through as an open map.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

/// Chunking strategy chosen per store version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkingStrategy {
    Structural,
    FixedLine,
    ByteWindow,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        ChunkingStrategy::Structural
    }
}

/// Per-store-version configuration. Immutable once the version reaches `ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionConfig {
    pub embedding_model: String,
    #[serde(default)]
    pub chunking_strategy: ChunkingStrategy,
    #[serde(default = "default_max_chunk_lines")]
    pub max_chunk_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    #[serde(default = "default_dense_dim")]
    pub dense_dim: usize,
}

fn default_max_chunk_lines() -> usize {
    120
}
fn default_overlap_lines() -> usize {
    10
}
fn default_dense_dim() -> usize {
    384
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            embedding_model: "minilm".to_string(),
            chunking_strategy: ChunkingStrategy::default(),
            max_chunk_lines: default_max_chunk_lines(),
            overlap_lines: default_overlap_lines(),
            dense_dim: default_dense_dim(),
        }
    }
}

impl VersionConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_chunk_lines == 0 {
            return Err(CoreError::validation("max_chunk_lines must be > 0"));
        }
        if self.overlap_lines >= self.max_chunk_lines {
            return Err(CoreError::validation("overlap_lines must be < max_chunk_lines"));
        }
        if self.dense_dim == 0 {
            return Err(CoreError::validation("dense_dim must be > 0"));
        }
        Ok(())
    }
}

/// Backend selection for one ML gateway capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayBackend {
    InProcessStub,
    RemoteHttp,
    GpuAccelerated,
}

/// What to do when a backend call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    Fallback,
    Error,
    CircuitBreaker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
    #[serde(default = "default_backend")]
    pub backend: GatewayBackend,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
    /// Base URL for `remote-http` backends.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_backend() -> GatewayBackend {
    GatewayBackend::InProcessStub
}
fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Fallback
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            failure_policy: default_failure_policy(),
            remote_url: None,
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub embed: CapabilityConfig,
    #[serde(default)]
    pub sparse: CapabilityConfig,
    #[serde(default)]
    pub rerank: CapabilityConfig,
    #[serde(default)]
    pub classify: CapabilityConfig,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_cache_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexingConfig {
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_max_path_bytes")]
    pub max_path_bytes: usize,
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

fn default_embed_batch_size() -> usize {
    32
}
fn default_upsert_batch_size() -> usize {
    128
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    100
}
fn default_worker_pool_size() -> usize {
    8
}
fn default_max_path_bytes() -> usize {
    1024
}
fn default_max_content_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: default_embed_batch_size(),
            upsert_batch_size: default_upsert_batch_size(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            worker_pool_size: default_worker_pool_size(),
            max_path_bytes: default_max_path_bytes(),
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

/// Per-request search options (spec §6 HTTP body fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchOptions {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub filter: Option<SearchFilter>,
    #[serde(default = "default_true")]
    pub enable_reranking: bool,
    #[serde(default)]
    pub rerank_top_k: Option<usize>,
    #[serde(default)]
    pub include_content: bool,
    #[serde(default)]
    pub sparse_weight: Option<f64>,
    #[serde(default)]
    pub dense_weight: Option<f64>,
    #[serde(default)]
    pub group_by_file: bool,
    #[serde(default)]
    pub max_per_file: Option<usize>,
}

fn default_top_k() -> usize {
    20
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SearchFilter {
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// Post-rank pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostRankConfig {
    #[serde(default = "default_true")]
    pub enable_dedup: bool,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_preserve_top")]
    pub preserve_top: usize,
    #[serde(default)]
    pub prefer_longer: bool,
    #[serde(default = "default_true")]
    pub enable_diversity: bool,
    #[serde(default = "default_diversity_lambda")]
    pub diversity_lambda: f32,
    #[serde(default)]
    pub group_by_file: bool,
    #[serde(default = "default_max_per_file")]
    pub max_per_file: usize,
}

fn default_dedup_threshold() -> f32 {
    0.85
}
fn default_preserve_top() -> usize {
    3
}
fn default_diversity_lambda() -> f32 {
    0.7
}
fn default_max_per_file() -> usize {
    3
}

impl Default for PostRankConfig {
    fn default() -> Self {
        Self {
            enable_dedup: true,
            dedup_threshold: default_dedup_threshold(),
            preserve_top: default_preserve_top(),
            prefer_longer: false,
            enable_diversity: true,
            diversity_lambda: default_diversity_lambda(),
            group_by_file: false,
            max_per_file: default_max_per_file(),
        }
    }
}

/// Reranker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    #[serde(default = "default_pass1_top_k")]
    pub pass1_top_k: usize,
    #[serde(default = "default_pass2_top_m")]
    pub pass2_top_m: usize,
    #[serde(default = "default_high_confidence")]
    pub high_confidence_threshold: f64,
    #[serde(default = "default_margin")]
    pub margin: f64,
}

fn default_rerank_top_k() -> usize {
    10
}
fn default_pass1_top_k() -> usize {
    40
}
fn default_pass2_top_m() -> usize {
    15
}
fn default_high_confidence() -> f64 {
    0.9
}
fn default_margin() -> f64 {
    0.15
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            rerank_top_k: default_rerank_top_k(),
            pass1_top_k: default_pass1_top_k(),
            pass2_top_m: default_pass2_top_m(),
            high_confidence_threshold: default_high_confidence(),
            margin: default_margin(),
        }
    }
}

/// Root runtime configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub post_rank: PostRankConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    #[serde(default = "default_telemetry_ring_size")]
    pub telemetry_ring_size: usize,
    #[serde(default = "default_query_log_rotate_bytes")]
    pub query_log_rotate_bytes: u64,
    /// Redis URL for the optional `redis-telemetry` sink; ignored unless
    /// that feature is enabled.
    #[serde(default)]
    pub telemetry_redis_url: Option<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_collection_prefix() -> String {
    String::new()
}
fn default_telemetry_ring_size() -> usize {
    10_000
}
fn default_query_log_rotate_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            gateway: GatewayConfig::default(),
            indexing: IndexingConfig::default(),
            post_rank: PostRankConfig::default(),
            rerank: RerankConfig::default(),
            collection_prefix: default_collection_prefix(),
            telemetry_ring_size: default_telemetry_ring_size(),
            query_log_rotate_bytes: default_query_log_rotate_bytes(),
            telemetry_redis_url: None,
        }
    }
}

impl RootConfig {
    /// Load from a TOML file, falling back to defaults if the path doesn't exist.
    pub fn load(path: &std::path::Path) -> CoreResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::validation(format!("failed to read config: {e}")))?;
        toml::from_str(&raw)
            .map_err(|e| CoreError::validation(format!("invalid config at {}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// Validation helpers shared by every API surface (spec §6 validation limits)
// ---------------------------------------------------------------------------

pub fn validate_query_text(query: &str) -> CoreResult<()> {
    let len = query.chars().count();
    if len == 0 || len > 10_000 {
        return Err(CoreError::validation("query must be 1-10000 chars"));
    }
    Ok(())
}

pub fn validate_store_name(name: &str) -> CoreResult<()> {
    let len = name.len();
    if len == 0 || len > 64 {
        return Err(CoreError::validation("store name must be 1-64 bytes"));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(CoreError::validation(
            "store name must start with an alphanumeric character",
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CoreError::validation(
            "store name may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

const RESERVED_WINDOWS_NAMES: &[&str] =
    &["con", "prn", "aux", "nul", "com1", "com2", "lpt1", "lpt2"];

pub fn validate_path(path: &str, max_bytes: usize) -> CoreResult<()> {
    if path.is_empty() || path.len() > max_bytes {
        return Err(CoreError::validation(format!("path must be 1-{max_bytes} bytes")));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(CoreError::validation("absolute paths are not allowed"));
    }
    if path.contains("..") {
        return Err(CoreError::validation("path traversal is not allowed"));
    }
    if path.contains('\0') {
        return Err(CoreError::validation("null bytes are not allowed in paths"));
    }
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err(CoreError::validation("drive-qualified absolute paths are not allowed"));
    }
    let stem = path
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .split('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if RESERVED_WINDOWS_NAMES.contains(&stem.as_str()) {
        return Err(CoreError::validation(format!("'{stem}' is a reserved file name")));
    }
    Ok(())
}

pub fn validate_top_k(top_k: usize) -> CoreResult<()> {
    if top_k == 0 || top_k > 1000 {
        return Err(CoreError::validation("top_k must be 1-1000"));
    }
    Ok(())
}

pub fn validate_weight(weight: f64) -> CoreResult<()> {
    if !(0.0..=1.0).contains(&weight) {
        return Err(CoreError::validation("weight must be in [0.0, 1.0]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_boundary() {
        assert!(validate_query_text("").is_err());
        assert!(validate_query_text(&"a".repeat(10_000)).is_ok());
        assert!(validate_query_text(&"a".repeat(10_001)).is_err());
    }

    #[test]
    fn store_name_boundary() {
        assert!(validate_store_name("-demo").is_err());
        assert!(validate_store_name("_demo").is_err());
        assert!(validate_store_name("demo-1").is_ok());
    }

    #[test]
    fn path_boundary() {
        assert!(validate_path("../x", 1024).is_err());
        assert!(validate_path("/etc/x", 1024).is_err());
        assert!(validate_path("C:\\x", 1024).is_err());
        assert!(validate_path("x\0y", 1024).is_err());
        assert!(validate_path("con.txt", 1024).is_err());
        assert!(validate_path("src/main.rs", 1024).is_ok());
    }

    #[test]
    fn top_k_boundary() {
        assert!(validate_top_k(1000).is_ok());
        assert!(validate_top_k(1001).is_err());
        assert!(validate_top_k(0).is_err());
    }

    #[test]
    fn weight_boundary() {
        assert!(validate_weight(1.0).is_ok());
        assert!(validate_weight(1.000_001).is_err());
        assert!(validate_weight(-0.0001).is_err());
    }
}
