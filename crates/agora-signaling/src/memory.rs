//! In-process signaling store with a per-call change feed.
//!
//! Holds the authoritative copy of every Call row and candidate log on the
//! relay, and doubles as the shared channel between two devices running in
//! the same process.
//!
//! Two indexes:
//! - `calls`: call_id → row, candidate log, and broadcast feed
//! - `patches`: call_id → every applied patch, in order (write audit)

use crate::{SignalingChannel, SignalingEvent, Subscription};
use agora_common::models::{Call, CallPatch, IceCandidate};
use agora_common::{SignalingError, SignalingResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

/// Default per-call feed capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// One call's row, its candidate log, and its subscribers.
struct CallEntry {
    call: Call,
    candidates: Vec<IceCandidate>,
    feed: broadcast::Sender<SignalingEvent>,
    patches: Vec<CallPatch>,
}

/// Injected faults, for exercising delivery and write failures.
#[derive(Debug, Default)]
struct Faults {
    /// Number of upcoming writes to reject with a transport error.
    failing_writes: u32,
    /// Publish every event twice.
    duplicate_delivery: bool,
}

/// In-memory implementation of [`SignalingChannel`].
#[derive(Clone)]
pub struct MemorySignaling {
    calls: Arc<RwLock<HashMap<Uuid, CallEntry>>>,
    faults: Arc<Mutex<Faults>>,
    capacity: usize,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            calls: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Mutex::new(Faults::default())),
            capacity: capacity.max(1),
        }
    }

    /// Reject the next `count` writes with a transport error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.faults.lock().await.failing_writes = count;
    }

    /// Deliver every event twice, as an at-least-once feed may.
    pub async fn set_duplicate_delivery(&self, enabled: bool) {
        self.faults.lock().await.duplicate_delivery = enabled;
    }

    /// Patches applied to a call, in order.
    pub async fn patches(&self, call_id: Uuid) -> Vec<CallPatch> {
        self.calls
            .read()
            .await
            .get(&call_id)
            .map(|entry| entry.patches.clone())
            .unwrap_or_default()
    }

    /// Candidates logged for a call, in insertion order.
    pub async fn candidates(&self, call_id: Uuid) -> Vec<IceCandidate> {
        self.calls
            .read()
            .await
            .get(&call_id)
            .map(|entry| entry.candidates.clone())
            .unwrap_or_default()
    }

    /// Drop rows of calls that reached a terminal status.
    pub async fn purge_finished(&self) -> usize {
        let mut calls = self.calls.write().await;
        let before = calls.len();
        calls.retain(|_, entry| !entry.call.status.is_terminal());
        let purged = before - calls.len();
        if purged > 0 {
            tracing::info!(count = purged, "Purged finished calls");
        }
        purged
    }

    /// Get store-wide stats.
    pub async fn stats(&self) -> SignalingStats {
        let calls = self.calls.read().await;
        SignalingStats {
            total_calls: calls.len(),
            active_calls: calls
                .values()
                .filter(|e| !e.call.status.is_terminal())
                .count(),
            candidates: calls.values().map(|e| e.candidates.len()).sum(),
            subscribers: calls.values().map(|e| e.feed.receiver_count()).sum(),
        }
    }

    /// Consume one pending injected write failure, if any.
    async fn take_write_fault(&self) -> SignalingResult<()> {
        let mut faults = self.faults.lock().await;
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(SignalingError::Transport("injected write failure".into()));
        }
        Ok(())
    }

    async fn publish(&self, feed: &broadcast::Sender<SignalingEvent>, event: SignalingEvent) {
        let copies = if self.faults.lock().await.duplicate_delivery { 2 } else { 1 };
        for _ in 0..copies {
            // No receivers is fine: the row is still the source of truth.
            let _ = feed.send(event.clone());
        }
    }
}

impl Default for MemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn create_call(&self, call: Call) -> SignalingResult<Call> {
        self.take_write_fault().await?;

        let mut calls = self.calls.write().await;
        if calls.contains_key(&call.id) {
            return Err(SignalingError::AlreadyExists {
                resource: format!("Call {}", call.id),
            });
        }

        let (feed, _) = broadcast::channel(self.capacity);
        calls.insert(
            call.id,
            CallEntry {
                call: call.clone(),
                candidates: Vec::new(),
                feed,
                patches: Vec::new(),
            },
        );

        tracing::info!(
            call = %call.id,
            caller = %call.caller_id,
            callee = %call.callee_id,
            call_type = ?call.call_type,
            "Call created"
        );

        Ok(call)
    }

    async fn fetch_call(&self, call_id: Uuid) -> SignalingResult<Call> {
        self.calls
            .read()
            .await
            .get(&call_id)
            .map(|entry| entry.call.clone())
            .ok_or_else(|| SignalingError::call_not_found(call_id))
    }

    async fn update_call(&self, call_id: Uuid, patch: CallPatch) -> SignalingResult<Call> {
        self.take_write_fault().await?;

        let (updated, feed) = {
            let mut calls = self.calls.write().await;
            let entry = calls
                .get_mut(&call_id)
                .ok_or_else(|| SignalingError::call_not_found(call_id))?;

            if !patch.condition.holds(&entry.call) {
                tracing::debug!(
                    call = %call_id,
                    condition = ?patch.condition,
                    status = %entry.call.status,
                    "Conditional update rejected"
                );
                return Err(SignalingError::ConditionFailed {
                    current: Box::new(entry.call.clone()),
                });
            }

            entry.call.apply(&patch);
            entry.patches.push(patch);
            (entry.call.clone(), entry.feed.clone())
        };

        self.publish(&feed, SignalingEvent::CallUpdated(updated.clone()))
            .await;
        Ok(updated)
    }

    async fn insert_candidate(&self, candidate: IceCandidate) -> SignalingResult<()> {
        self.take_write_fault().await?;

        let feed = {
            let mut calls = self.calls.write().await;
            let entry = calls
                .get_mut(&candidate.call_id)
                .ok_or_else(|| SignalingError::call_not_found(candidate.call_id))?;
            entry.candidates.push(candidate.clone());
            entry.feed.clone()
        };

        self.publish(&feed, SignalingEvent::CandidateInserted(candidate))
            .await;
        Ok(())
    }

    async fn subscribe(&self, call_id: Uuid) -> SignalingResult<Subscription> {
        let calls = self.calls.read().await;
        let entry = calls
            .get(&call_id)
            .ok_or_else(|| SignalingError::call_not_found(call_id))?;

        // Receiver first, then snapshot: anything written in between shows up
        // in both, never in neither.
        let live = entry.feed.subscribe();
        let mut backlog = Vec::with_capacity(entry.candidates.len() + 1);
        backlog.push(SignalingEvent::CallUpdated(entry.call.clone()));
        backlog.extend(
            entry
                .candidates
                .iter()
                .cloned()
                .map(SignalingEvent::CandidateInserted),
        );

        Ok(Subscription::new(call_id, backlog, live).with_resync(Arc::new(self.clone())))
    }
}

/// Store-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SignalingStats {
    pub total_calls: usize,
    pub active_calls: usize,
    pub candidates: usize,
    pub subscribers: usize,
}
