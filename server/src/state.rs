//! Shared application state handed to every axum handler and MCP session.

use std::sync::Arc;
use std::time::Instant;

use codecortex_core::Runtime;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime, start_time: Instant::now() }
    }
}
