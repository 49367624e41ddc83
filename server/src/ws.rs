//! WebSocket ingest (spec §6): a connection streams files to index as they
//! change on disk; the server indexes each batch against the store's active
//! version and replies with progress or error frames.
//!
//! Frames are processed strictly in the order the connection sent them —
//! one in-flight batch at a time per socket — but replies are not serialized
//! with input frames, so a slow batch doesn't block later `ping` frames from
//! being answered out of band. On disconnect the in-flight batch's
//! cancellation token is fired so the indexing task stops promptly rather
//! than finishing into a closed socket.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use codecortex_core::document::Document;

use crate::state::AppState;

const BATCH_WINDOW: Duration = Duration::from_millis(200);
const MAX_BATCH_SIZE: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    File { path: String, content: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Indexed { batch_id: String, files_count: usize, chunks_queued: usize },
    Error { code: String, message: String },
    Throttle,
    Pong,
}

pub async fn upgrade(
    State(state): State<AppState>,
    Path(store): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, store))
}

async fn handle_socket(socket: WebSocket, state: AppState, store: String) {
    let (mut sender, mut receiver) = socket.split();
    let cancel = CancellationToken::new();
    let mut pending: Vec<Document> = Vec::new();
    let mut window_start: Option<Instant> = None;

    loop {
        let recv_fut = receiver.next();
        let timeout = tokio::time::sleep(BATCH_WINDOW);
        tokio::select! {
            msg = recv_fut => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::File { path, content }) => {
                                pending.push(Document { path, content, language: None, extra: Default::default() });
                                if window_start.is_none() {
                                    window_start = Some(Instant::now());
                                }
                                if pending.len() >= MAX_BATCH_SIZE {
                                    flush(&state, &store, &mut pending, &mut window_start, &mut sender, cancel.clone()).await;
                                }
                            }
                            Ok(ClientFrame::Ping) => {
                                let _ = send_frame(&mut sender, &ServerFrame::Pong).await;
                            }
                            Err(e) => {
                                let _ = send_frame(&mut sender, &ServerFrame::Error {
                                    code: "bad_frame".to_string(),
                                    message: e.to_string(),
                                }).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        cancel.cancel();
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => {
                        cancel.cancel();
                        break;
                    }
                }
            }
            _ = timeout => {
                if window_start.map(|t| t.elapsed() >= BATCH_WINDOW).unwrap_or(false) {
                    flush(&state, &store, &mut pending, &mut window_start, &mut sender, cancel.clone()).await;
                }
            }
        }
    }

    flush(&state, &store, &mut pending, &mut window_start, &mut sender, cancel).await;
}

async fn send_frame(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(Message::Text(text.into())).await
}

async fn flush(
    state: &AppState,
    store: &str,
    pending: &mut Vec<Document>,
    window_start: &mut Option<Instant>,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    cancel: CancellationToken,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<Document> = std::mem::take(pending);
    *window_start = None;
    let files_count = batch.len();
    let batch_id = uuid::Uuid::new_v4().to_string();

    let resolved = match state.runtime.registry.resolve(store, None) {
        Ok(r) => r,
        Err(e) => {
            let _ = send_frame(sender, &ServerFrame::Error { code: "not_found".to_string(), message: e.to_string() }).await;
            return;
        }
    };

    if cancel.is_cancelled() {
        return;
    }

    let result = tokio::select! {
        r = state.runtime.index_pipeline.index(&resolved, batch, false) => r,
        _ = cancel.cancelled() => return,
    };

    match result {
        Ok(report) => {
            let _ = send_frame(sender, &ServerFrame::Indexed {
                batch_id,
                files_count,
                chunks_queued: report.chunks_total,
            }).await;
        }
        Err(e) if e.is_retryable() => {
            let _ = send_frame(sender, &ServerFrame::Throttle).await;
        }
        Err(e) => {
            let _ = send_frame(sender, &ServerFrame::Error { code: "index_failed".to_string(), message: e.to_string() }).await;
        }
    }
}
