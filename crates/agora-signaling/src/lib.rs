//! # agora-signaling
//!
//! The signaling channel between the two devices of a call. It is a
//! row-change feed keyed by call id:
//! - writes are conditional updates of the `Call` row and inserts into the
//!   `IceCandidate` log
//! - subscribers receive every row change and every candidate insert
//!
//! Delivery is at-least-once with no ordering guarantee. A subscription first
//! replays the current row and the existing candidates, then streams live
//! changes, so a consumer may see the same state more than once.
//!
//! Implementations:
//! - [`memory::MemorySignaling`]: in-process store, used by the relay and tests
//! - [`client::RelaySignaling`]: a device's connection to the relay
//! - [`relay`]: WebSocket endpoint exposing a store to remote devices

pub mod client;
pub mod memory;
pub mod protocol;
pub mod relay;
pub mod session;

use agora_common::models::{Call, CallPatch, IceCandidate};
use agora_common::SignalingResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub use client::RelaySignaling;
pub use memory::MemorySignaling;

/// A change delivered to subscribers of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalingEvent {
    /// The full row after an update.
    CallUpdated(Call),
    /// A new row in the candidate log.
    CandidateInserted(IceCandidate),
}

impl SignalingEvent {
    pub fn call_id(&self) -> Uuid {
        match self {
            Self::CallUpdated(call) => call.id,
            Self::CandidateInserted(candidate) => candidate.call_id,
        }
    }
}

/// Read/write access to the Call and IceCandidate tables plus their change feed.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Insert a new call row. Fails with `AlreadyExists` for a known id.
    async fn create_call(&self, call: Call) -> SignalingResult<Call>;

    async fn fetch_call(&self, call_id: Uuid) -> SignalingResult<Call>;

    /// Conditional update. Returns the row after the patch, or
    /// `ConditionFailed` carrying the current row when the guard does not hold.
    async fn update_call(&self, call_id: Uuid, patch: CallPatch) -> SignalingResult<Call>;

    /// Append to the candidate log.
    async fn insert_candidate(&self, candidate: IceCandidate) -> SignalingResult<()>;

    /// Stream of changes for one call, starting with a replay of its current state.
    async fn subscribe(&self, call_id: Uuid) -> SignalingResult<Subscription>;
}

#[async_trait]
impl<T: SignalingChannel + ?Sized> SignalingChannel for Arc<T> {
    async fn create_call(&self, call: Call) -> SignalingResult<Call> {
        (**self).create_call(call).await
    }

    async fn fetch_call(&self, call_id: Uuid) -> SignalingResult<Call> {
        (**self).fetch_call(call_id).await
    }

    async fn update_call(&self, call_id: Uuid, patch: CallPatch) -> SignalingResult<Call> {
        (**self).update_call(call_id, patch).await
    }

    async fn insert_candidate(&self, candidate: IceCandidate) -> SignalingResult<()> {
        (**self).insert_candidate(candidate).await
    }

    async fn subscribe(&self, call_id: Uuid) -> SignalingResult<Subscription> {
        (**self).subscribe(call_id).await
    }
}

/// Change feed for a single call.
///
/// The backlog is drained first, then live events. Events for other calls
/// sharing the same underlying feed are skipped.
///
/// When the live feed overflows, a subscription with a resync channel
/// subscribes again and replays the fresh backlog, so no row change or
/// candidate is lost. Without one, skipped events are gone.
pub struct Subscription {
    call_id: Uuid,
    backlog: VecDeque<SignalingEvent>,
    live: broadcast::Receiver<SignalingEvent>,
    resync: Option<Arc<dyn SignalingChannel>>,
}

impl Subscription {
    pub fn new(
        call_id: Uuid,
        backlog: Vec<SignalingEvent>,
        live: broadcast::Receiver<SignalingEvent>,
    ) -> Self {
        Self {
            call_id,
            backlog: backlog.into(),
            live,
            resync: None,
        }
    }

    /// Recover from feed overflow by re-subscribing through `channel`.
    pub fn with_resync(mut self, channel: Arc<dyn SignalingChannel>) -> Self {
        self.resync = Some(channel);
        self
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Take the replayed events that have not been delivered yet.
    pub fn take_backlog(&mut self) -> Vec<SignalingEvent> {
        self.backlog.drain(..).collect()
    }

    /// Next event, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<SignalingEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }

            match self.live.recv().await {
                Ok(event) if event.call_id() == self.call_id => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.resync(skipped).await,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Replace the overflowed feed with a fresh subscription and its backlog.
    async fn resync(&mut self, skipped: u64) {
        let Some(channel) = self.resync.clone() else {
            tracing::warn!(call = %self.call_id, skipped, "Signaling subscriber lagged, events dropped");
            return;
        };

        match channel.subscribe(self.call_id).await {
            Ok(mut fresh) => {
                tracing::warn!(call = %self.call_id, skipped, "Signaling subscriber lagged, replaying current state");
                self.backlog = fresh.take_backlog().into();
                self.live = fresh.live;
            }
            Err(e) => {
                tracing::warn!(call = %self.call_id, skipped, error = %e, "Signaling resync failed, events dropped");
            }
        }
    }
}
