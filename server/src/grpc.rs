//! gRPC surface (spec §6): the same operations as the HTTP API, generated
//! from `proto/codecortex.proto` via `tonic-build`. Deadlines are honored
//! because every RPC just awaits the same core calls the HTTP handlers do,
//! inside tonic's own deadline-aware request future; nothing here blocks.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use codecortex_core::config::{SearchFilter as CoreSearchFilter, SearchOptions};
use codecortex_core::document::Document as CoreDocument;
use codecortex_core::Runtime;

use crate::error::to_status;
use crate::search::{self, SearchRequest as CoreSearchRequest};

pub mod proto {
    tonic::include_proto!("codecortex.v1");
}

use proto::code_cortex_server::{CodeCortex, CodeCortexServer};
use proto::*;

pub struct GrpcService {
    runtime: Arc<Runtime>,
}

/// Spec §6: "max message size 100 MiB".
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

impl GrpcService {
    pub fn new(runtime: Arc<Runtime>) -> CodeCortexServer<Self> {
        CodeCortexServer::new(Self { runtime })
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE)
    }
}

#[tonic::async_trait]
impl CodeCortex for GrpcService {
    async fn search(&self, request: Request<SearchRequest>) -> Result<Response<SearchResponse>, Status> {
        let req = request.into_inner();
        let filter = req.filter.map(|f| CoreSearchFilter {
            path_prefix: f.path_prefix,
            languages: if f.languages.is_empty() { None } else { Some(f.languages) },
            connection_id: f.connection_id,
        });
        let options = SearchOptions {
            query: req.query,
            top_k: req.top_k.map(|v| v as usize).unwrap_or(20),
            filter,
            enable_reranking: req.enable_reranking.unwrap_or(true),
            rerank_top_k: req.rerank_top_k.map(|v| v as usize),
            include_content: req.include_content.unwrap_or(false),
            sparse_weight: req.sparse_weight,
            dense_weight: req.dense_weight,
            group_by_file: req.group_by_file.unwrap_or(false),
            max_per_file: req.max_per_file.map(|v| v as usize),
        };
        let core_request =
            CoreSearchRequest { store: req.store, version: req.version, options, connection_id: None };
        let response = search::search(&self.runtime, core_request).await.map_err(to_status)?;
        Ok(Response::new(SearchResponse {
            request_id: response.request_id,
            store: response.store,
            version: response.version,
            strategy: response.strategy,
            intent: response.intent,
            results: response
                .results
                .into_iter()
                .map(|r| SearchResultItem {
                    chunk_id: r.chunk_id,
                    path: r.path,
                    score: r.score,
                    start_line: r.start_line as u32,
                    end_line: r.end_line as u32,
                    language: r.language,
                    symbols: r.symbols,
                    content: r.content,
                })
                .collect(),
            took_ms: response.took_ms as u64,
            rerank_skipped: response.rerank_skipped,
            rerank_skip_reason: response.rerank_skip_reason,
        }))
    }

    async fn index_files(
        &self,
        request: Request<IndexFilesRequest>,
    ) -> Result<Response<IndexFilesResponse>, Status> {
        let req = request.into_inner();
        let resolved = self.runtime.registry.resolve(&req.store, req.version.as_deref()).map_err(to_status)?;
        let documents: Vec<CoreDocument> = req
            .documents
            .into_iter()
            .map(|d| CoreDocument { path: d.path, content: d.content, language: d.language, extra: Default::default() })
            .collect();
        let report =
            self.runtime.index_pipeline.index(&resolved, documents, req.force).await.map_err(to_status)?;
        Ok(Response::new(IndexFilesResponse {
            indexed: report.indexed as u32,
            skipped: report.skipped as u32,
            failed: report.failed as u32,
            chunks_total: report.chunks_total as u32,
            duration_ms: report.duration_ms as u64,
        }))
    }

    async fn delete_files(
        &self,
        request: Request<DeleteFilesRequest>,
    ) -> Result<Response<DeleteFilesResponse>, Status> {
        let req = request.into_inner();
        let resolved = self.runtime.registry.resolve(&req.store, req.version.as_deref()).map_err(to_status)?;
        let deleted = if let Some(prefix) = &req.path_prefix {
            self.runtime.index_pipeline.delete_by_prefix(&resolved, prefix).await.map_err(to_status)?
        } else {
            self.runtime.index_pipeline.delete(&resolved, &req.paths).await.map_err(to_status)?
        };
        Ok(Response::new(DeleteFilesResponse { deleted: deleted as u32 }))
    }

    async fn sync_index(&self, request: Request<SyncIndexRequest>) -> Result<Response<SyncIndexResponse>, Status> {
        let req = request.into_inner();
        let resolved = self.runtime.registry.resolve(&req.store, req.version.as_deref()).map_err(to_status)?;
        let removed =
            self.runtime.index_pipeline.sync(&resolved, &req.current_paths).await.map_err(to_status)?;
        Ok(Response::new(SyncIndexResponse { removed: removed as u32 }))
    }

    async fn create_store(&self, request: Request<CreateStoreRequest>) -> Result<Response<StoreInfo>, Status> {
        let req = request.into_inner();
        self.runtime.registry.create_store(&req.name, &req.description).map_err(to_status)?;
        let record = self.runtime.registry.get_store(&req.name).map_err(to_status)?;
        Ok(Response::new(StoreInfo {
            name: record.name,
            description: record.description,
            active_version: record.active_version,
            version_count: record.versions.len() as u32,
        }))
    }

    async fn list_stores(&self, _request: Request<ListStoresRequest>) -> Result<Response<ListStoresResponse>, Status> {
        let stores = self
            .runtime
            .registry
            .list_stores()
            .into_iter()
            .map(|r| StoreInfo {
                name: r.name,
                description: r.description,
                active_version: r.active_version,
                version_count: r.versions.len() as u32,
            })
            .collect();
        Ok(Response::new(ListStoresResponse { stores }))
    }

    async fn get_store_stats(&self, request: Request<GetStoreStatsRequest>) -> Result<Response<StoreStats>, Status> {
        let req = request.into_inner();
        let record = self.runtime.registry.get_store(&req.store).map_err(to_status)?;
        let indexed_files = self.runtime.tracker.paths(&req.store).map_err(to_status)?.len();
        Ok(Response::new(StoreStats {
            store: record.name,
            active_version: record.active_version,
            version_count: record.versions.len() as u32,
            indexed_files: indexed_files as u32,
        }))
    }

    async fn embed(&self, request: Request<EmbedRequest>) -> Result<Response<EmbedResponse>, Status> {
        let req = request.into_inner();
        let vectors = self.runtime.gateway.embed(&req.texts).await.map_err(to_status)?;
        Ok(Response::new(EmbedResponse {
            vectors: vectors.into_iter().map(|v| FloatVector { values: v.0 }).collect(),
        }))
    }

    async fn sparse_encode(&self, request: Request<EmbedRequest>) -> Result<Response<SparseEncodeResponse>, Status> {
        let req = request.into_inner();
        let vectors = self.runtime.gateway.sparse_encode(&req.texts).await.map_err(to_status)?;
        Ok(Response::new(SparseEncodeResponse {
            vectors: vectors.into_iter().map(|v| SparseVector { indices: v.indices, weights: v.weights }).collect(),
        }))
    }

    async fn rerank(&self, request: Request<RerankRequest>) -> Result<Response<RerankResponse>, Status> {
        let req = request.into_inner();
        let ranked =
            self.runtime.gateway.rerank(&req.query, &req.documents, req.top_k as usize).await.map_err(to_status)?;
        Ok(Response::new(RerankResponse {
            results: ranked.into_iter().map(|r| RerankedDoc { index: r.index as u32, score: r.score }).collect(),
        }))
    }

    async fn health(&self, _request: Request<HealthRequest>) -> Result<Response<HealthResponse>, Status> {
        let status = self.runtime.engine.health().await.map_err(to_status)?;
        Ok(Response::new(HealthResponse { status, version: env!("CARGO_PKG_VERSION").to_string() }))
    }
}
