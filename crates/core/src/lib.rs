//! `codecortex-core`: the retrieval-and-ranking pipeline and the indexing
//! pipeline that feeds it, plus their shared store/version model, event bus,
//! and observability substrate. See `RootConfig` for startup configuration
//! and `Runtime` for how the pieces are wired together.

pub mod bus;
pub mod chunker;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod index_pipeline;
pub mod lifecycle;
pub mod postrank;
pub mod query_understanding;
pub mod reranker;
pub mod registry;
pub mod retriever;
pub mod telemetry;
pub mod tracker;
pub mod util;
pub mod vector_engine;

use std::sync::Arc;

use bus::{EventBus, InProcessBus, InstrumentedBus};
use config::RootConfig;
use error::CoreResult;
use gateway::Gateway;
use index_pipeline::IndexPipeline;
use lifecycle::Lifecycle;
use registry::Registry;
use telemetry::{QueryLog, Telemetry};
use tracker::FileTracker;
use vector_engine::{InMemoryVectorEngine, VectorEngine};

/// All subsystems wired together at startup, held explicitly and passed to
/// request handlers rather than reached through ambient globals (spec §9
/// "Global mutable state").
pub struct Runtime {
    pub config: RootConfig,
    pub registry: Registry,
    pub gateway: Arc<Gateway>,
    pub engine: Arc<dyn VectorEngine>,
    pub tracker: Arc<FileTracker>,
    pub bus: Arc<dyn EventBus>,
    pub index_pipeline: IndexPipeline,
    pub telemetry: Arc<Telemetry>,
    pub lifecycle: Arc<Lifecycle>,
}

impl Runtime {
    /// Builds a runtime with the in-memory reference vector engine. A
    /// deployment backed by a real external vector/full-text engine
    /// constructs its own `Arc<dyn VectorEngine>` and calls
    /// `Runtime::with_engine` instead.
    pub fn new(config: RootConfig) -> CoreResult<Self> {
        let engine: Arc<dyn VectorEngine> = Arc::new(InMemoryVectorEngine::new());
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: RootConfig, engine: Arc<dyn VectorEngine>) -> CoreResult<Self> {
        let registry = Registry::new(config.data_dir.clone(), config.collection_prefix.clone())?;
        let gateway = Arc::new(Gateway::new(config.gateway.clone(), "minilm"));
        let tracker = Arc::new(FileTracker::new(config.data_dir.clone()));
        let base_bus = InProcessBus::new();
        let bus: Arc<dyn EventBus> = InstrumentedBus::new(base_bus);
        let query_log = QueryLog::new(config.data_dir.clone(), config.query_log_rotate_bytes);
        let mut telemetry = Telemetry::new(config.telemetry_ring_size, Some(query_log));
        #[cfg(feature = "redis-telemetry")]
        if let Some(url) = &config.telemetry_redis_url {
            match telemetry::RedisSink::new(url, "codecortex:telemetry") {
                Ok(sink) => telemetry = telemetry.with_sink(Arc::new(sink)),
                Err(e) => tracing::error!(error = %e, "failed to construct redis telemetry sink"),
            }
        }
        let telemetry = Arc::new(telemetry);
        let lifecycle = Lifecycle::new();

        let index_pipeline =
            IndexPipeline::new(config.indexing.clone(), gateway.clone(), engine.clone(), tracker.clone(), bus.clone());

        Ok(Self { config, registry, gateway, engine, tracker, bus, index_pipeline, telemetry, lifecycle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_builds_with_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RootConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let runtime = Runtime::new(config);
        assert!(runtime.is_ok());
    }
}
