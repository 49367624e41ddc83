//! End-to-end HTTP API scenarios, mirroring the literal request/response
//! pairs used to validate the retrieval pipeline: create a store, index
//! documents, search, skip unchanged reindexes, and sync deletions.

mod helpers;

use helpers::TestHarness;
use serde_json::json;

#[tokio::test]
async fn create_index_search() {
    let h = TestHarness::new();

    let (status, _) = h.post("/v1/stores", json!({ "name": "demo" })).await;
    assert_eq!(status, 201);

    let (status, body) = h
        .post(
            "/v1/stores/demo/index",
            json!({ "documents": [{ "path": "a.go", "content": "package main\nfunc Hello(){}\n", "language": "go" }] }),
        )
        .await;
    assert_eq!(status, 200, "index failed: {body:?}");
    assert_eq!(body["indexed"], 1);
    assert_eq!(body["skipped"], 0);
    assert_eq!(body["failed"], 0);
    // One structural chunk for the `package` preamble, one for `func Hello`.
    assert_eq!(body["chunks_total"], 2);

    let (status, body) = h.post("/v1/stores/demo/search", json!({ "query": "Hello", "top_k": 5 })).await;
    assert_eq!(status, 200, "search failed: {body:?}");
    let results = body["results"].as_array().expect("results array");
    assert!(!results.is_empty(), "expected at least one result: {body:?}");
    let first = &results[0];
    assert_eq!(first["path"], "a.go");
    assert_eq!(first["start_line"], 2);
    let symbols = first["symbols"].as_array().expect("symbols array");
    assert!(symbols.iter().any(|s| s == "Hello"), "expected Hello in symbols: {symbols:?}");
}

#[tokio::test]
async fn reindex_unchanged_is_skipped() {
    let h = TestHarness::new();
    h.post("/v1/stores", json!({ "name": "demo" })).await;

    let body = json!({ "documents": [{ "path": "a.go", "content": "package main\nfunc Hello(){}\n", "language": "go" }] });
    let (status, first) = h.post("/v1/stores/demo/index", body.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(first["indexed"], 1);

    let (status, second) = h.post("/v1/stores/demo/index", body).await;
    assert_eq!(status, 200);
    assert_eq!(second["indexed"], 0);
    assert_eq!(second["skipped"], 1);
    assert_eq!(second["chunks_total"], 0);
}

#[tokio::test]
async fn sync_deletes_missing_paths() {
    let h = TestHarness::new();
    h.post("/v1/stores", json!({ "name": "demo" })).await;
    h.post(
        "/v1/stores/demo/index",
        json!({ "documents": [{ "path": "a.go", "content": "package main\nfunc Hello(){}\n", "language": "go" }] }),
    )
    .await;

    let (status, body) = h.post("/v1/stores/demo/index/sync", json!({ "current_paths": [] })).await;
    assert_eq!(status, 200, "sync failed: {body:?}");
    assert_eq!(body["removed"], 1);

    let (status, body) = h.post("/v1/stores/demo/search", json!({ "query": "Hello", "top_k": 5 })).await;
    assert_eq!(status, 200);
    let results = body["results"].as_array().expect("results array");
    assert!(results.is_empty(), "expected no results after sync delete: {body:?}");
}

#[tokio::test]
async fn delete_by_prefix_then_reindex_restores_chunk_count() {
    let h = TestHarness::new();
    h.post("/v1/stores", json!({ "name": "demo" })).await;
    let docs = json!({ "documents": [
        { "path": "pkg/a.go", "content": "package pkg\nfunc A(){}\n", "language": "go" },
        { "path": "pkg/b.go", "content": "package pkg\nfunc B(){}\n", "language": "go" },
    ] });
    let (_, first) = h.post("/v1/stores/demo/index", docs.clone()).await;
    let chunks_before = first["chunks_total"].as_u64().unwrap();

    let (status, body) = h.delete("/v1/stores/demo/index", json!({ "path_prefix": "pkg/" })).await;
    assert_eq!(status, 200, "delete failed: {body:?}");
    assert_eq!(body["deleted"].as_u64().unwrap(), chunks_before);

    let (_, reindexed) = h.post("/v1/stores/demo/index", docs).await;
    assert_eq!(reindexed["chunks_total"].as_u64().unwrap(), chunks_before);
}

#[tokio::test]
async fn version_promote_atomicity() {
    let h = TestHarness::new();
    h.post("/v1/stores", json!({ "name": "demo" })).await;

    let (status, body) = h.post("/v1/stores/demo/versions", json!({ "embedding_model": "minilm" })).await;
    assert_eq!(status, 201, "create_version failed: {body:?}");
    let v2 = body["id"].as_str().unwrap().to_string();
    assert_eq!(v2, "v2");

    let (status, _) = h.post(&format!("/v1/stores/demo/versions/{v2}/promote"), json!({})).await;
    assert_eq!(status, 409, "promoting a non-ready version must conflict");

    let (status, _) = h.post(&format!("/v1/stores/demo/versions/{v2}/ready"), json!({})).await;
    assert_eq!(status, 204);
    let (status, _) = h.post(&format!("/v1/stores/demo/versions/{v2}/promote"), json!({})).await;
    assert_eq!(status, 204);

    let (_, store) = h.get("/v1/stores/demo").await;
    assert_eq!(store["active_version"], v2);
    let versions = store["versions"].as_array().unwrap();
    let v1 = versions.iter().find(|v| v["id"] == "v1").unwrap();
    assert_eq!(v1["status"], "deprecated");
}

#[tokio::test]
async fn boundary_validation() {
    let h = TestHarness::new();
    h.post("/v1/stores", json!({ "name": "demo" })).await;

    let (status, _) = h.post("/v1/stores/demo/search", json!({ "query": "" })).await;
    assert_eq!(status, 400, "empty query must be rejected");

    let (status, _) = h.post("/v1/stores/demo/search", json!({ "query": "x", "top_k": 1001 })).await;
    assert_eq!(status, 400, "top_k above 1000 must be rejected");

    let (status, _) =
        h.post("/v1/stores/demo/search", json!({ "query": "x", "sparse_weight": 1.000001 })).await;
    assert_eq!(status, 400, "weight above 1.0 must be rejected");

    let (status, _) = h.post("/v1/stores", json!({ "name": "-bad" })).await;
    assert_eq!(status, 400, "store name starting with '-' must be rejected");

    let (status, body) = h
        .post("/v1/stores/demo/index", json!({ "documents": [{ "path": "../escape", "content": "x" }] }))
        .await;
    assert_eq!(status, 400, "path traversal must be rejected: {body:?}");
}

#[tokio::test]
async fn readyz_flips_unavailable_during_drain() {
    let h = TestHarness::new();
    let (status, _) = h.get("/readyz").await;
    assert_eq!(status, 200);
}
