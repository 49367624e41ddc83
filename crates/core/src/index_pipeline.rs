//! Index pipeline (spec §4.5): dedup-by-hash, chunk, encode, upsert, track.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::bus::{EventBus, TOPIC_INDEX_PROGRESS};
use crate::chunker::chunk_document;
use crate::config::IndexingConfig;
use crate::document::{content_hash, Document};
use crate::error::{CoreError, CoreResult};
use crate::gateway::Gateway;
use crate::registry::ResolvedVersion;
use crate::tracker::{FileTracker, TrackedFile};
use crate::vector_engine::{Point, VectorEngine, VectorFilter};

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub chunks_total: usize,
    pub errors: Vec<IndexError>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexError {
    pub path: String,
    pub message: String,
}

/// Per-`(store, path)` keyed locks so concurrent indexing calls on the same
/// document path are serialized while distinct paths proceed in parallel.
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl KeyedLocks {
    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

pub struct IndexPipeline {
    config: IndexingConfig,
    gateway: Arc<Gateway>,
    engine: Arc<dyn VectorEngine>,
    tracker: Arc<FileTracker>,
    bus: Arc<dyn EventBus>,
    keyed_locks: KeyedLocks,
}

impl IndexPipeline {
    pub fn new(
        config: IndexingConfig,
        gateway: Arc<Gateway>,
        engine: Arc<dyn VectorEngine>,
        tracker: Arc<FileTracker>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self { config, gateway, engine, tracker, bus, keyed_locks: KeyedLocks::default() }
    }

    /// Indexes a batch of documents into `resolved`'s collection.
    pub async fn index(&self, resolved: &ResolvedVersion, documents: Vec<Document>, force: bool) -> CoreResult<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport::default();
        let total = documents.len();

        self.engine.create_collection(&resolved.dense_collection, resolved.config.dense_dim).await?;

        for (i, doc) in documents.into_iter().enumerate() {
            crate::config::validate_path(&doc.path, self.config.max_path_bytes)?;
            if doc.content.len() as u64 > self.config.max_content_bytes as u64 {
                report.failed += 1;
                report.errors.push(IndexError { path: doc.path.clone(), message: "content exceeds max_content_bytes".to_string() });
                continue;
            }

            let lock = self.keyed_locks.lock_for(&format!("{}:{}", resolved.store, doc.path));
            let _guard = lock.lock().await;

            let hash = content_hash(&doc.content);
            if !force {
                if let Ok(Some(tracked)) = self.tracker.get(&resolved.store, &doc.path) {
                    if tracked.content_hash == hash {
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            match self.index_one(resolved, &doc, &hash).await {
                Ok(chunk_count) => {
                    report.indexed += 1;
                    report.chunks_total += chunk_count;
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(IndexError { path: doc.path.clone(), message: e.to_string() });
                }
            }

            self.bus.publish(
                TOPIC_INDEX_PROGRESS,
                serde_json::json!({
                    "percentage": ((i + 1) as f64 / total.max(1) as f64 * 100.0),
                    "files_processed": i + 1,
                    "total": total,
                }),
            );
        }

        report.duration_ms = start.elapsed().as_millis();
        Ok(report)
    }

    /// Indexes a single document: chunk, encode, upsert, track. All-or-nothing:
    /// an encoding failure for any chunk fails the whole document.
    async fn index_one(&self, resolved: &ResolvedVersion, doc: &Document, doc_hash: &str) -> CoreResult<usize> {
        let chunks = chunk_document(
            doc,
            doc_hash,
            resolved.config.chunking_strategy,
            resolved.config.max_chunk_lines,
            resolved.config.overlap_lines,
        );
        if chunks.is_empty() {
            self.tracker.commit_batch(
                &resolved.store,
                vec![TrackedFile {
                    path: doc.path.clone(),
                    content_hash: doc_hash.to_string(),
                    size: doc.size(),
                    indexed_at_ms: crate::util::unix_timestamp_ms(),
                    chunk_count: 0,
                }],
            )?;
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut points = Vec::with_capacity(chunks.len());

        for batch in texts.chunks(self.config.embed_batch_size).zip(chunks.chunks(self.config.embed_batch_size)) {
            let (text_batch, chunk_batch) = batch;
            let dense = self.gateway.embed(&text_batch.to_vec()).await?;
            let sparse = self.gateway.sparse_encode(&text_batch.to_vec()).await?;

            for ((chunk, dense_vec), sparse_vec) in chunk_batch.iter().zip(dense.into_iter()).zip(sparse.into_iter()) {
                let mut payload: HashMap<String, serde_json::Value> = HashMap::new();
                payload.insert("store".to_string(), serde_json::json!(resolved.store));
                payload.insert("path".to_string(), serde_json::json!(chunk.path));
                payload.insert("language".to_string(), serde_json::json!(chunk.language));
                payload.insert("content".to_string(), serde_json::json!(chunk.text));
                payload.insert("symbols".to_string(), serde_json::json!(chunk.symbols));
                payload.insert("start_line".to_string(), serde_json::json!(chunk.start_line));
                payload.insert("end_line".to_string(), serde_json::json!(chunk.end_line));
                payload.insert("document_hash".to_string(), serde_json::json!(chunk.doc_hash));
                payload.insert("chunk_hash".to_string(), serde_json::json!(chunk.chunk_hash));
                payload.insert("indexed_at".to_string(), serde_json::json!(crate::util::unix_timestamp_ms()));
                // The in-memory reference engine's `query()` returns payload only, not
                // vectors, so the post-rank stage's cosine-similarity dedup/MMR needs
                // the embedding carried here too.
                payload.insert("embedding".to_string(), serde_json::json!(dense_vec.0.clone()));

                points.push(Point {
                    id: chunk.chunk_id.clone(),
                    dense: Some(dense_vec),
                    sparse: Some(sparse_vec),
                    payload,
                });
            }
        }

        self.upsert_with_retry(&resolved.dense_collection, points).await?;

        self.tracker.commit_batch(
            &resolved.store,
            vec![TrackedFile {
                path: doc.path.clone(),
                content_hash: doc_hash.to_string(),
                size: doc.size(),
                indexed_at_ms: crate::util::unix_timestamp_ms(),
                chunk_count: chunks.len(),
            }],
        )?;

        Ok(chunks.len())
    }

    async fn upsert_with_retry(&self, collection: &str, points: Vec<Point>) -> CoreResult<()> {
        for sub_batch in points.chunks(self.config.upsert_batch_size) {
            let mut attempt = 0u32;
            loop {
                match self.engine.upsert(collection, sub_batch.to_vec()).await {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && attempt + 1 < self.config.max_attempts => {
                        attempt += 1;
                        let backoff = self.config.base_backoff_ms * 2u64.pow(attempt - 1);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    pub async fn delete(&self, resolved: &ResolvedVersion, paths: &[String]) -> CoreResult<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let filter = VectorFilter { paths: Some(paths.to_vec()), ..Default::default() };
        let removed = self.engine.delete_by_filter(&resolved.dense_collection, &filter).await?;
        self.tracker.remove(&resolved.store, paths)?;
        Ok(removed)
    }

    pub async fn delete_by_prefix(&self, resolved: &ResolvedVersion, prefix: &str) -> CoreResult<usize> {
        let filter = VectorFilter { path_prefix: Some(prefix.to_string()), ..Default::default() };
        let removed = self.engine.delete_by_filter(&resolved.dense_collection, &filter).await?;
        self.tracker.remove_by_prefix(&resolved.store, prefix)?;
        Ok(removed)
    }

    /// `Sync(store, current_paths)`: removes tracker/index entries for paths
    /// no longer present, leaving `tracker_paths ∩ current_paths` behind.
    pub async fn sync(&self, resolved: &ResolvedVersion, current_paths: &[String]) -> CoreResult<usize> {
        let missing = self.tracker.missing_from(&resolved.store, current_paths)?;
        if missing.is_empty() {
            return Ok(0);
        }
        self.delete(resolved, &missing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::config::{GatewayConfig, VersionConfig};
    use crate::vector_engine::InMemoryVectorEngine;

    fn pipeline() -> (tempfile::TempDir, IndexPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(Gateway::new(GatewayConfig::default(), "minilm"));
        let engine: Arc<dyn VectorEngine> = Arc::new(InMemoryVectorEngine::new());
        let tracker = Arc::new(FileTracker::new(dir.path()));
        let bus: Arc<dyn EventBus> = InProcessBus::new();
        (dir, IndexPipeline::new(IndexingConfig::default(), gateway, engine, tracker, bus))
    }

    fn resolved(store: &str) -> ResolvedVersion {
        ResolvedVersion {
            store: store.to_string(),
            version: "v1".to_string(),
            dense_collection: format!("{store}_v1"),
            sparse_index: format!("{store}_v1_sparse"),
            config: VersionConfig::default(),
        }
    }

    #[tokio::test]
    async fn index_then_reindex_unchanged_is_skipped() {
        let (_dir, pipeline) = pipeline();
        let resolved = resolved("demo");
        let docs = vec![Document {
            path: "a.go".to_string(),
            content: "package main\nfunc Hello(){}\n".to_string(),
            language: Some("go".to_string()),
            extra: Default::default(),
        }];
        let report = pipeline.index(&resolved, docs.clone(), false).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.skipped, 0);

        let report2 = pipeline.index(&resolved, docs, false).await.unwrap();
        assert_eq!(report2.indexed, 0);
        assert_eq!(report2.skipped, 1);
    }

    #[tokio::test]
    async fn sync_removes_missing_paths() {
        let (_dir, pipeline) = pipeline();
        let resolved = resolved("demo");
        let docs = vec![Document {
            path: "a.go".to_string(),
            content: "package main\nfunc Hello(){}\n".to_string(),
            language: Some("go".to_string()),
            extra: Default::default(),
        }];
        pipeline.index(&resolved, docs, false).await.unwrap();
        let removed = pipeline.sync(&resolved, &[]).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = pipeline.tracker.paths("demo").unwrap();
        assert!(remaining.is_empty());
    }
}
