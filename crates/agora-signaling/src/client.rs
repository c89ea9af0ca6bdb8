//! Async WebSocket client for the signaling relay.
//!
//! Implements [`SignalingChannel`] for a device talking to a remote relay.
//! Requests are correlated with replies by request id; dispatched change
//! events fan out to every local [`Subscription`] through one broadcast.

use crate::protocol::RelayFrame;
use crate::{SignalingChannel, SignalingEvent, Subscription};
use agora_common::config::SignalingConfig;
use agora_common::models::{Call, CallPatch, IceCandidate};
use agora_common::{SignalingError, SignalingResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Successful relay replies.
#[derive(Debug)]
enum Reply {
    Ack(Option<Call>),
    Backlog(Vec<SignalingEvent>),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SignalingResult<Reply>>>>>;

/// A device's connection to the relay.
///
/// ```rust,no_run
/// use agora_signaling::{RelaySignaling, SignalingChannel};
///
/// # async fn run(call_id: uuid::Uuid) -> agora_common::SignalingResult<()> {
/// let relay = RelaySignaling::connect(&Default::default()).await?;
/// let mut feed = relay.subscribe(call_id).await?;
/// while let Some(event) = feed.recv().await {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct RelaySignaling {
    outbound: mpsc::Sender<RelayFrame>,
    pending: Pending,
    /// Dropped by the reader task on disconnect, which closes every subscription.
    events: Arc<Mutex<Option<broadcast::Sender<SignalingEvent>>>>,
    next_request: AtomicU64,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RelaySignaling {
    /// Connect to the relay at `config.url` and start the I/O tasks.
    pub async fn connect(config: &SignalingConfig) -> SignalingResult<Self> {
        let (ws, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<RelayFrame>(256);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let events = Arc::new(Mutex::new(Some(events_tx)));

        info!(url = %config.url, "Connected to signaling relay");

        // Writer task
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Relay: failed to encode frame: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task
        let reader_pending = Arc::clone(&pending);
        let reader_events = Arc::clone(&events);
        let heartbeat_tx = outbound.clone();
        let reader = tokio::spawn(async move {
            let mut heartbeat: Option<JoinHandle<()>> = None;

            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t.as_str().to_owned(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay: connection error: {e}");
                        break;
                    }
                };
                let frame = match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Relay: undecodable frame: {e}");
                        continue;
                    }
                };

                match frame {
                    RelayFrame::Hello {
                        heartbeat_interval_ms,
                    } => {
                        let interval = match heartbeat_interval_ms {
                            0 => DEFAULT_HEARTBEAT,
                            ms => Duration::from_millis(ms),
                        };
                        if let Some(task) = heartbeat.take() {
                            task.abort();
                        }
                        heartbeat = Some(spawn_heartbeat(heartbeat_tx.clone(), interval));
                    }
                    RelayFrame::Ack { request_id, call } => {
                        resolve(&reader_pending, request_id, Ok(Reply::Ack(call))).await;
                    }
                    RelayFrame::Backlog {
                        request_id, events, ..
                    } => {
                        resolve(&reader_pending, request_id, Ok(Reply::Backlog(events))).await;
                    }
                    RelayFrame::Error {
                        request_id: Some(request_id),
                        error,
                    } => {
                        let err = SignalingError::from_body(error);
                        resolve(&reader_pending, request_id, Err(err)).await;
                    }
                    RelayFrame::Error {
                        request_id: None,
                        error,
                    } => warn!("Relay: error {}: {}", error.code, error.message),
                    RelayFrame::Dispatch { event } => {
                        if let Some(tx) = reader_events.lock().await.as_ref() {
                            let _ = tx.send(event);
                        }
                    }
                    RelayFrame::HeartbeatAck { .. } => debug!("Relay: heartbeat ack"),
                    _ => {}
                }
            }

            if let Some(task) = heartbeat.take() {
                task.abort();
            }
            // Fail outstanding requests and close subscriptions.
            reader_pending.lock().await.clear();
            reader_events.lock().await.take();
            info!("Relay: disconnected");
        });

        Ok(Self {
            outbound,
            pending,
            events,
            next_request: AtomicU64::new(1),
            request_timeout: config.request_timeout(),
            tasks: vec![writer, reader],
        })
    }

    async fn request(&self, build: impl FnOnce(u64) -> RelayFrame) -> SignalingResult<Reply> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self.outbound.send(build(request_id)).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(SignalingError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(SignalingError::Timeout)
            }
        }
    }

    async fn request_call(&self, build: impl FnOnce(u64) -> RelayFrame) -> SignalingResult<Call> {
        match self.request(build).await? {
            Reply::Ack(Some(call)) => Ok(call),
            other => Err(SignalingError::Transport(format!(
                "unexpected relay reply: {other:?}"
            ))),
        }
    }
}

impl Drop for RelaySignaling {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for RelaySignaling {
    async fn create_call(&self, call: Call) -> SignalingResult<Call> {
        self.request_call(|request_id| RelayFrame::CreateCall { request_id, call })
            .await
    }

    async fn fetch_call(&self, call_id: Uuid) -> SignalingResult<Call> {
        self.request_call(|request_id| RelayFrame::FetchCall {
            request_id,
            call_id,
        })
        .await
    }

    async fn update_call(&self, call_id: Uuid, patch: CallPatch) -> SignalingResult<Call> {
        self.request_call(|request_id| RelayFrame::UpdateCall {
            request_id,
            call_id,
            patch,
        })
        .await
    }

    async fn insert_candidate(&self, candidate: IceCandidate) -> SignalingResult<()> {
        self.request(|request_id| RelayFrame::InsertCandidate {
            request_id,
            candidate,
        })
        .await
        .map(|_| ())
    }

    async fn subscribe(&self, call_id: Uuid) -> SignalingResult<Subscription> {
        // Receiver before request, so no dispatch can slip past us.
        let live = match self.events.lock().await.as_ref() {
            Some(tx) => tx.subscribe(),
            None => return Err(SignalingError::Closed),
        };

        match self
            .request(|request_id| RelayFrame::Subscribe {
                request_id,
                call_id,
            })
            .await?
        {
            Reply::Backlog(events) => Ok(Subscription::new(call_id, events, live)),
            other => Err(SignalingError::Transport(format!(
                "unexpected relay reply: {other:?}"
            ))),
        }
    }
}

async fn resolve(pending: &Pending, request_id: u64, reply: SignalingResult<Reply>) {
    match pending.lock().await.remove(&request_id) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(request_id, "Relay: reply for unknown or expired request"),
    }
}

fn spawn_heartbeat(outbound: mpsc::Sender<RelayFrame>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let frame = RelayFrame::Heartbeat {
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            if outbound.send(frame).await.is_err() {
                break;
            }
        }
    })
}
