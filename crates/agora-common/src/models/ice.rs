//! ICE candidate log: append-only, one row per discovered network path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snowflake::generate_id;

/// A network candidate published by one side of a call.
///
/// Rows are never mutated or deleted. Only the side that did not send a
/// candidate applies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub id: Uuid,
    pub call_id: Uuid,
    pub sender_id: Uuid,
    /// Opaque transport descriptor (`candidate:...` line).
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl IceCandidate {
    pub fn new(call_id: Uuid, sender_id: Uuid, candidate: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            call_id,
            sender_id,
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            created_at: Utc::now(),
        }
    }
}
