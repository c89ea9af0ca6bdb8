//! Relay wire protocol: frames exchanged between a device and the relay.
//!
//! Every client request carries a `request_id`; the relay answers with
//! exactly one `Ack`, `Backlog`, or `Error` bearing the same id. Change-feed
//! events are pushed as `Dispatch` frames for calls the connection has
//! subscribed to.

use crate::SignalingEvent;
use agora_common::error::ErrorBody;
use agora_common::models::{Call, CallPatch, IceCandidate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client ↔ relay frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum RelayFrame {
    // === Client → Relay ===
    CreateCall {
        request_id: u64,
        call: Call,
    },

    FetchCall {
        request_id: u64,
        call_id: Uuid,
    },

    UpdateCall {
        request_id: u64,
        call_id: Uuid,
        patch: CallPatch,
    },

    InsertCandidate {
        request_id: u64,
        candidate: IceCandidate,
    },

    /// Start receiving `Dispatch` frames for a call.
    Subscribe {
        request_id: u64,
        call_id: Uuid,
    },

    Unsubscribe {
        call_id: Uuid,
    },

    /// Bidirectional keepalive.
    Heartbeat {
        timestamp: i64,
    },

    // === Relay → Client ===
    /// Sent once on connect.
    Hello {
        heartbeat_interval_ms: u64,
    },

    /// Write or read succeeded. `call` is the row, when the request concerns one.
    Ack {
        request_id: u64,
        call: Option<Call>,
    },

    /// Reply to `Subscribe`: the call's current state.
    Backlog {
        request_id: u64,
        call_id: Uuid,
        events: Vec<SignalingEvent>,
    },

    Dispatch {
        event: SignalingEvent,
    },

    HeartbeatAck {
        timestamp: i64,
    },

    Error {
        request_id: Option<u64>,
        error: ErrorBody,
    },
}

impl RelayFrame {
    /// Request id of a client request or of the relay's reply to one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::CreateCall { request_id, .. }
            | Self::FetchCall { request_id, .. }
            | Self::UpdateCall { request_id, .. }
            | Self::InsertCandidate { request_id, .. }
            | Self::Subscribe { request_id, .. }
            | Self::Ack { request_id, .. }
            | Self::Backlog { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::models::{CallStatus, CallType};

    #[test]
    fn test_frames_use_op_and_d() {
        let frame = RelayFrame::Heartbeat { timestamp: 42 };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "Heartbeat");
        assert_eq!(json["d"]["timestamp"], 42);
    }

    #[test]
    fn test_update_frame_parses() {
        let call_id = Uuid::now_v7();
        let raw = serde_json::json!({
            "op": "UpdateCall",
            "d": {
                "request_id": 7,
                "call_id": call_id,
                "patch": { "status": "declined", "condition": { "kind": "not_terminal" } }
            }
        });
        let frame: RelayFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.request_id(), Some(7));
        match frame {
            RelayFrame::UpdateCall { patch, .. } => {
                assert_eq!(patch.status, Some(CallStatus::Declined));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_backlog_carries_events() {
        let call = Call::new(Uuid::now_v7(), Uuid::now_v7(), CallType::Video);
        let frame = RelayFrame::Backlog {
            request_id: 1,
            call_id: call.id,
            events: vec![SignalingEvent::CallUpdated(call.clone())],
        };
        let text = serde_json::to_string(&frame).unwrap();
        match serde_json::from_str::<RelayFrame>(&text).unwrap() {
            RelayFrame::Backlog { events, .. } => {
                assert_eq!(events, vec![SignalingEvent::CallUpdated(call)]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
