//! Model Context Protocol surface (spec §6): JSON-RPC 2.0 over stdio and
//! streamable HTTP, exposing search and store administration as MCP tools
//! and resources so an MCP-aware agent can use codecortex without going
//! through the raw HTTP API.

use std::io::{self, BufRead, Write as IoWrite};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use codecortex_core::config::SearchOptions;
use codecortex_core::Runtime;

use crate::search::{self, SearchRequest};
use crate::state::AppState;

const PROTOCOL_VERSION: &str = "2025-06-18";

fn tool_definitions() -> Value {
    json!([
        {
            "name": "code_search",
            "description": "Hybrid sparse+dense code search over an indexed store. Returns ranked, reranked, deduplicated results.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "store": { "type": "string" },
                    "query": { "type": "string" },
                    "top_k": { "type": "integer" },
                    "version": { "type": "string" }
                },
                "required": ["store", "query"]
            }
        },
        {
            "name": "index_files",
            "description": "Index or reindex a batch of files into a store's active version.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "store": { "type": "string" },
                    "documents": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "content": { "type": "string" }
                            },
                            "required": ["path", "content"]
                        }
                    }
                },
                "required": ["store", "documents"]
            }
        },
        {
            "name": "delete_files",
            "description": "Remove indexed files from a store by path.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "store": { "type": "string" },
                    "paths": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["store", "paths"]
            }
        },
        {
            "name": "list_stores",
            "description": "List all stores and their active version.",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "get_store_stats",
            "description": "Get indexed file count and version history for a store.",
            "inputSchema": {
                "type": "object",
                "properties": { "store": { "type": "string" } },
                "required": ["store"]
            }
        }
    ])
}

fn resources_list() -> Value {
    json!([
        { "uriTemplate": "store://{name}/files", "name": "Indexed files", "mimeType": "application/json" },
        { "uriTemplate": "store://{name}/stats", "name": "Store stats", "mimeType": "application/json" },
        { "uriTemplate": "store://{name}/file/{path}", "name": "Indexed file content", "mimeType": "text/plain" },
    ])
}

fn prompts_list() -> Value {
    json!([
        {
            "name": "find-usage",
            "description": "Find where a symbol or pattern is used across the indexed codebase",
            "arguments": [{ "name": "symbol", "description": "Symbol or phrase to search for", "required": true }]
        }
    ])
}

async fn call_tool(runtime: &Runtime, name: &str, args: &Value) -> Result<Value, Value> {
    match name {
        "code_search" => {
            let store = args["store"].as_str().ok_or_else(|| invalid_params("store is required"))?;
            let query = args["query"].as_str().ok_or_else(|| invalid_params("query is required"))?;
            let top_k = args.get("top_k").and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(20);
            let version = args.get("version").and_then(|v| v.as_str()).map(|s| s.to_string());
            let options = SearchOptions {
                query: query.to_string(),
                top_k,
                filter: None,
                enable_reranking: true,
                rerank_top_k: None,
                include_content: true,
                sparse_weight: None,
                dense_weight: None,
                group_by_file: false,
                max_per_file: None,
            };
            let request = SearchRequest { store: store.to_string(), version, options, connection_id: None };
            let response = search::search(runtime, request).await.map_err(internal_error)?;
            Ok(serde_json::to_value(response).unwrap_or(Value::Null))
        }
        "index_files" => {
            let store = args["store"].as_str().ok_or_else(|| invalid_params("store is required"))?;
            let documents: Vec<codecortex_core::document::Document> =
                serde_json::from_value(args.get("documents").cloned().unwrap_or(Value::Null))
                    .map_err(|e| invalid_params(&e.to_string()))?;
            let resolved = runtime.registry.resolve(store, None).map_err(internal_error)?;
            let report = runtime.index_pipeline.index(&resolved, documents, false).await.map_err(internal_error)?;
            Ok(serde_json::to_value(report).unwrap_or(Value::Null))
        }
        "delete_files" => {
            let store = args["store"].as_str().ok_or_else(|| invalid_params("store is required"))?;
            let paths: Vec<String> = serde_json::from_value(args.get("paths").cloned().unwrap_or(Value::Null))
                .map_err(|e| invalid_params(&e.to_string()))?;
            let resolved = runtime.registry.resolve(store, None).map_err(internal_error)?;
            let deleted = runtime.index_pipeline.delete(&resolved, &paths).await.map_err(internal_error)?;
            Ok(json!({ "deleted": deleted }))
        }
        "list_stores" => Ok(serde_json::to_value(runtime.registry.list_stores()).unwrap_or(Value::Null)),
        "get_store_stats" => {
            let store = args["store"].as_str().ok_or_else(|| invalid_params("store is required"))?;
            let record = runtime.registry.get_store(store).map_err(internal_error)?;
            let indexed_files = runtime.tracker.paths(store).map_err(internal_error)?.len();
            Ok(json!({
                "store": record.name,
                "active_version": record.active_version,
                "version_count": record.versions.len(),
                "indexed_files": indexed_files,
            }))
        }
        _ => Err(json!({ "code": -32601, "message": format!("Unknown tool: {name}") })),
    }
}

fn invalid_params(message: &str) -> Value {
    json!({ "code": -32602, "message": message })
}

fn internal_error<E: std::fmt::Display>(e: E) -> Value {
    json!({ "code": -32603, "message": e.to_string() })
}

async fn read_resource(runtime: &Runtime, uri: &str) -> Result<Value, Value> {
    let rest = uri.strip_prefix("store://").ok_or_else(|| invalid_params("unsupported uri scheme"))?;
    let mut parts = rest.splitn(2, '/');
    let store = parts.next().unwrap_or("");
    let kind = parts.next().unwrap_or("");
    if kind == "files" {
        let paths = runtime.tracker.paths(store).map_err(internal_error)?;
        return Ok(json!({ "contents": [{ "uri": uri, "mimeType": "application/json", "text": serde_json::to_string(&paths).unwrap_or_default() }] }));
    }
    if kind == "stats" {
        let record = runtime.registry.get_store(store).map_err(internal_error)?;
        let text = serde_json::to_string(&record).unwrap_or_default();
        return Ok(json!({ "contents": [{ "uri": uri, "mimeType": "application/json", "text": text }] }));
    }
    if let Some(path) = kind.strip_prefix("file/") {
        let file = runtime.tracker.get(store, path).map_err(internal_error)?;
        return match file {
            Some(f) => Ok(json!({ "contents": [{ "uri": uri, "mimeType": "text/plain", "text": format!("{path} (hash {})", f.content_hash) }] })),
            None => Err(json!({ "code": -32602, "message": format!("no such file: {path}") })),
        };
    }
    Err(invalid_params("unknown resource kind"))
}

/// Processes one JSON-RPC request and returns the response, or `None` for
/// notifications (no `id` field or a `notifications/*` method).
pub async fn dispatch_jsonrpc(runtime: &Runtime, msg: &Value) -> Option<Value> {
    let method = msg["method"].as_str().unwrap_or("");
    let id = msg.get("id").cloned();

    if id.is_none() || method.starts_with("notifications/") {
        return None;
    }

    let response = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "resources": { "listChanged": false },
                    "prompts": { "listChanged": false }
                },
                "serverInfo": { "name": "codecortex", "version": env!("CARGO_PKG_VERSION") },
                "instructions": "Hybrid code search over indexed stores. Use code_search to find relevant chunks, index_files/delete_files to keep a store current, list_stores and get_store_stats to inspect state."
            }
        }),
        "tools/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tool_definitions() } }),
        "tools/call" => {
            let name = msg["params"]["name"].as_str().unwrap_or("");
            let args = msg["params"].get("arguments").cloned().unwrap_or(json!({}));
            match call_tool(runtime, name, &args).await {
                Ok(result) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "content": [{ "type": "text", "text": serde_json::to_string(&result).unwrap_or_default() }], "isError": false }
                }),
                Err(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e }),
            }
        }
        "resources/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": resources_list() } }),
        "resources/read" => {
            let uri = msg["params"]["uri"].as_str().unwrap_or("");
            match read_resource(runtime, uri).await {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e }),
            }
        }
        "prompts/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "prompts": prompts_list() } }),
        "prompts/get" => {
            let name = msg["params"]["name"].as_str().unwrap_or("");
            if name == "find-usage" {
                let symbol = msg["params"]["arguments"]["symbol"].as_str().unwrap_or("");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "messages": [{ "role": "user", "content": { "type": "text", "text": format!("Find all usages of `{symbol}` in the indexed codebase using code_search.") } }]
                    }
                })
            } else {
                json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32602, "message": format!("Unknown prompt: {name}") } })
            }
        }
        "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
        _ => json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32601, "message": "Method not found" } }),
    };

    Some(response)
}

/// Runs the MCP server over stdio, one JSON-RPC message per line.
pub async fn run_stdio(runtime: Arc<Runtime>) {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut initialized = false;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = json!({ "jsonrpc": "2.0", "id": null, "error": { "code": -32700, "message": "Parse error" } });
                let mut out = stdout.lock();
                let _ = writeln!(out, "{err}");
                let _ = out.flush();
                continue;
            }
        };
        let method = msg["method"].as_str().unwrap_or("");
        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                let err = json!({ "jsonrpc": "2.0", "id": id, "error": { "code": -32002, "message": "Server not initialized" } });
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", serde_json::to_string(&err).unwrap());
                let _ = out.flush();
            }
            continue;
        }
        if let Some(response) = dispatch_jsonrpc(&runtime, &msg).await {
            if method == "initialize" {
                initialized = true;
            }
            let mut out = stdout.lock();
            let _ = writeln!(out, "{}", serde_json::to_string(&response).unwrap());
            let _ = out.flush();
        }
    }
}

/// Streamable-HTTP MCP transport: a single `POST /mcp` accepting one
/// JSON-RPC message (or notification) per request.
pub fn router() -> Router<AppState> {
    Router::new().route("/mcp", post(handle_post))
}

async fn handle_post(State(state): State<AppState>, Json(msg): Json<Value>) -> impl IntoResponse {
    match dispatch_jsonrpc(&state.runtime, &msg).await {
        Some(response) => Json(response).into_response(),
        None => axum::http::StatusCode::ACCEPTED.into_response(),
    }
}
