//! MCP (JSON-RPC over streamable HTTP) scenarios: initialize, list tools,
//! and call the index/search tools end to end through `POST /mcp`.

mod helpers;

use helpers::TestHarness;
use serde_json::json;

#[tokio::test]
async fn initialize_negotiates_protocol_and_capabilities() {
    let h = TestHarness::new();
    let (status, body) = h
        .post("/mcp", json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["serverInfo"]["name"], "codecortex");
    assert!(body["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn tools_list_includes_code_search_and_index_files() {
    let h = TestHarness::new();
    let (status, body) = h.post("/mcp", json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" })).await;
    assert_eq!(status, 200);
    let tools = body["result"]["tools"].as_array().expect("tools array");
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert!(names.contains(&"code_search"));
    assert!(names.contains(&"index_files"));
    assert!(names.contains(&"list_stores"));
}

#[tokio::test]
async fn tools_call_index_then_search_round_trip() {
    let h = TestHarness::new();
    h.post("/v1/stores", json!({ "name": "demo" })).await;

    let (status, body) = h
        .post(
            "/mcp",
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {
                    "name": "index_files",
                    "arguments": {
                        "store": "demo",
                        "documents": [{ "path": "a.go", "content": "package main\nfunc Hello(){}\n", "language": "go" }]
                    }
                }
            }),
        )
        .await;
    assert_eq!(status, 200, "tools/call index_files failed: {body:?}");
    assert_eq!(body["result"]["isError"], false);

    let (status, body) = h
        .post(
            "/mcp",
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "code_search", "arguments": { "store": "demo", "query": "Hello" } }
            }),
        )
        .await;
    assert_eq!(status, 200, "tools/call code_search failed: {body:?}");
    assert_eq!(body["result"]["isError"], false);
    let text = body["result"]["content"][0]["text"].as_str().expect("text content");
    let parsed: serde_json::Value = serde_json::from_str(text).expect("embedded json");
    let results = parsed["results"].as_array().expect("results array");
    assert!(!results.is_empty(), "expected at least one result: {parsed:?}");
}

#[tokio::test]
async fn tools_call_unknown_tool_returns_json_rpc_error() {
    let h = TestHarness::new();
    let (status, body) = h
        .post(
            "/mcp",
            json!({ "jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": { "name": "not_a_tool", "arguments": {} } }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn notification_without_id_gets_no_body() {
    let h = TestHarness::new();
    let (status, body) = h
        .post("/mcp", json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .await;
    assert_eq!(status, 202);
    assert_eq!(body, serde_json::Value::Null);
}
