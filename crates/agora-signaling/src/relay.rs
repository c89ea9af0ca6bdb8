//! Signaling relay: exposes a [`MemorySignaling`] store over WebSocket.
//!
//! Flow for one device:
//!
//! 1. Device connects to /signaling, relay sends `Hello`
//! 2. Device issues requests (create/fetch/update call, insert candidate),
//!    each answered by `Ack` or `Error` with the same request id
//! 3. `Subscribe` is answered by a `Backlog` of the call's current state,
//!    followed by `Dispatch` frames for every later change
//! 4. Device disconnects → its forwarding tasks are aborted
//!
//! The relay holds no call logic. It applies conditional writes and fans
//! changes out; both devices run their own state machines.

use crate::memory::MemorySignaling;
use crate::protocol::RelayFrame;
use crate::session::SessionManager;
use crate::SignalingChannel;
use agora_common::error::ErrorBody;
use agora_common::models::Call;
use agora_common::{SignalingError, SignalingResult};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Relay state: shared across all device connections.
#[derive(Clone)]
pub struct RelayState {
    pub store: MemorySignaling,
    pub sessions: Arc<SessionManager>,
    pub heartbeat_interval: Duration,
}

impl RelayState {
    pub fn new(store: MemorySignaling) -> Self {
        Self {
            store,
            sessions: Arc::new(SessionManager::new()),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Build the relay router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/signaling", get(ws_handler))
        .route("/health", get(health))
        .with_state(Arc::new(state))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    let stats = state.store.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.active_count().await,
        "store": stats,
    }))
}

/// Handle a single device connection.
async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();

    let session_id = Uuid::new_v4().to_string();
    state.sessions.register(session_id.clone()).await;

    // Direct-send channel: receive loop and forwarding tasks → sender task
    let (direct_tx, mut direct_rx) = mpsc::channel::<RelayFrame>(256);

    let hello = RelayFrame::Hello {
        heartbeat_interval_ms: state.heartbeat_interval.as_millis() as u64,
    };
    if direct_tx.send(hello).await.is_err() {
        return;
    }

    // ── Sender task ──────────────────────────────────────────────────────────
    let send_task = tokio::spawn(async move {
        while let Some(frame) = direct_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode relay frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!(session = %session_id, "Signaling client connected");

    // ── Receive loop ─────────────────────────────────────────────────────────
    let mut forwards: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let err = SignalingError::Json(e);
                        let _ = direct_tx.send(error_frame(None, &err)).await;
                        continue;
                    }
                };

                if let Some(reply) =
                    handle_frame(&state, &session_id, frame, &direct_tx, &mut forwards).await
                {
                    if direct_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    for (_, task) in forwards.drain() {
        task.abort();
    }
    state.sessions.remove(&session_id).await;
    send_task.abort();
    tracing::debug!(session = %session_id, "Signaling client disconnected");
}

/// Apply one client frame. Returns the direct reply, if any.
async fn handle_frame(
    state: &RelayState,
    session_id: &str,
    frame: RelayFrame,
    direct_tx: &mpsc::Sender<RelayFrame>,
    forwards: &mut HashMap<Uuid, JoinHandle<()>>,
) -> Option<RelayFrame> {
    match frame {
        RelayFrame::CreateCall { request_id, call } => {
            Some(ack(request_id, state.store.create_call(call).await.map(Some)))
        }

        RelayFrame::FetchCall {
            request_id,
            call_id,
        } => Some(ack(request_id, state.store.fetch_call(call_id).await.map(Some))),

        RelayFrame::UpdateCall {
            request_id,
            call_id,
            patch,
        } => Some(ack(
            request_id,
            state.store.update_call(call_id, patch).await.map(Some),
        )),

        RelayFrame::InsertCandidate {
            request_id,
            candidate,
        } => Some(ack(
            request_id,
            state.store.insert_candidate(candidate).await.map(|_| None),
        )),

        RelayFrame::Subscribe {
            request_id,
            call_id,
        } => {
            let mut subscription = match state.store.subscribe(call_id).await {
                Ok(sub) => sub,
                Err(e) => return Some(error_frame(Some(request_id), &e)),
            };

            // Backlog is queued before any live dispatch for this call.
            let backlog = RelayFrame::Backlog {
                request_id,
                call_id,
                events: subscription.take_backlog(),
            };
            if direct_tx.send(backlog).await.is_err() {
                return None;
            }

            let tx = direct_tx.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if tx.send(RelayFrame::Dispatch { event }).await.is_err() {
                        break;
                    }
                }
            });
            if let Some(previous) = forwards.insert(call_id, task) {
                previous.abort();
            }
            state.sessions.subscribe(session_id, call_id).await;

            tracing::debug!(session = %session_id, call = %call_id, "Subscribed to call");
            None
        }

        RelayFrame::Unsubscribe { call_id } => {
            if let Some(task) = forwards.remove(&call_id) {
                task.abort();
            }
            state.sessions.unsubscribe(session_id, call_id).await;
            None
        }

        RelayFrame::Heartbeat { .. } => {
            state.sessions.touch(session_id).await;
            Some(RelayFrame::HeartbeatAck {
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
        }

        // Relay → client frames should not be received from a client
        other => Some(RelayFrame::Error {
            request_id: other.request_id(),
            error: ErrorBody {
                code: "INVALID_OPCODE".into(),
                message: "Invalid opcode".into(),
                current: None,
            },
        }),
    }
}

fn ack(request_id: u64, result: SignalingResult<Option<Call>>) -> RelayFrame {
    match result {
        Ok(call) => RelayFrame::Ack { request_id, call },
        Err(e) => error_frame(Some(request_id), &e),
    }
}

fn error_frame(request_id: Option<u64>, err: &SignalingError) -> RelayFrame {
    if !matches!(err, SignalingError::ConditionFailed { .. }) {
        tracing::warn!(request = ?request_id, error = %err, "Relay request failed");
    }
    RelayFrame::Error {
        request_id,
        error: err.to_body(),
    }
}
