//! Test harness for HTTP API integration tests.
//!
//! Builds a full [`codecortex_server::app`] router over an in-memory
//! [`codecortex_core::vector_engine::InMemoryVectorEngine`] backed
//! [`Runtime`], and dispatches requests through it with `tower::oneshot`
//! (no subprocess, no real socket).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use codecortex_core::config::RootConfig;
use codecortex_core::Runtime;

pub struct TestHarness {
    app: Router,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut config = RootConfig::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let runtime = Arc::new(Runtime::new(config).expect("failed to build runtime"));
        let app = codecortex_server::app(runtime);
        TestHarness { app, _temp_dir: temp_dir }
    }

    async fn dispatch(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(req).await.expect("request dispatch failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("failed to read body");
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
        (status, body)
    }

    pub async fn get(&self, path: &str) -> (StatusCode, Value) {
        let req = Request::builder().method("GET").uri(path).body(Body::empty()).unwrap();
        self.dispatch(req).await
    }

    pub async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.dispatch(req).await
    }

    pub async fn delete(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("DELETE")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.dispatch(req).await
    }
}
