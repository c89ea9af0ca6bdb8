//! Signaling error types shared by every `SignalingChannel` implementation.
//!
//! The engine only ever sees these variants, whether the channel is the
//! in-process store or a WebSocket connection to a relay.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Call;

/// Failure of a read or a conditional write against the Call/IceCandidate tables.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    // === Resource errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    // === Conditional write ===
    /// The write's precondition did not hold. Carries the row as it is now.
    #[error("Conditional update rejected for call {}", current.id)]
    ConditionFailed { current: Box<Call> },

    // === Transport errors ===
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Signaling channel closed")]
    Closed,

    #[error("Timed out waiting for signaling acknowledgement")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable error body returned by the relay to remote clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<Call>,
}

impl SignalingError {
    pub fn call_not_found(call_id: Uuid) -> Self {
        Self::NotFound {
            resource: format!("Call {call_id}"),
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::ConditionFailed { .. } => "CONDITION_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Closed => "CLOSED",
            Self::Timeout => "TIMEOUT",
            Self::Json(_) => "INVALID_PAYLOAD",
        }
    }

    /// Convert into the wire body sent by the relay.
    pub fn to_body(&self) -> ErrorBody {
        let current = match self {
            Self::ConditionFailed { current } => Some((**current).clone()),
            _ => None,
        };
        ErrorBody {
            code: self.error_code().to_string(),
            message: self.to_string(),
            current,
        }
    }

    /// Rebuild an error received from the relay.
    pub fn from_body(body: ErrorBody) -> Self {
        match (body.code.as_str(), body.current) {
            ("CONDITION_FAILED", Some(current)) => Self::ConditionFailed {
                current: Box::new(current),
            },
            ("NOT_FOUND", _) => Self::NotFound {
                resource: body.message.trim_end_matches(" not found").to_string(),
            },
            ("ALREADY_EXISTS", _) => Self::AlreadyExists {
                resource: body.message.trim_end_matches(" already exists").to_string(),
            },
            ("CLOSED", _) => Self::Closed,
            ("TIMEOUT", _) => Self::Timeout,
            _ => Self::Transport(body.message),
        }
    }
}

/// Convenience type alias for Results using SignalingError.
pub type SignalingResult<T> = Result<T, SignalingError>;
