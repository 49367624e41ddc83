//! codecortex-server library crate: the HTTP/gRPC/WebSocket/MCP surfaces over
//! [`codecortex_core::Runtime`]. `main.rs` is a thin CLI shell over this crate
//! so integration tests can exercise the router and MCP dispatcher in-process
//! without a subprocess.

pub mod error;
pub mod grpc;
pub mod http;
pub mod mcp;
pub mod search;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use codecortex_core::Runtime;
use state::AppState;

/// Holds an [`codecortex_core::lifecycle::InFlightGuard`] for the duration of
/// the request so `/readyz`'s drain deadline (spec §4.12) sees an accurate
/// in-flight count and shutdown can wait for handlers to finish.
async fn track_in_flight(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let _guard = state.runtime.lifecycle.begin_request();
    next.run(request).await
}

/// Builds the full axum router (HTTP + MCP streamable-HTTP + WebSocket ingest)
/// over a shared [`Runtime`], with the same middleware stack the binary uses.
pub fn app(runtime: Arc<Runtime>) -> Router {
    let state = AppState::new(runtime);
    Router::new()
        .merge(http::router())
        .merge(mcp::router())
        .route("/v1/stores/{name}/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn_with_state(state.clone(), track_in_flight))
        .with_state(state)
}
