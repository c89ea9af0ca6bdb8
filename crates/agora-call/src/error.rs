//! Call error taxonomy.

use crate::media::MediaError;
use crate::state::EndReason;
use agora_common::SignalingError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Local media could not be acquired. Nothing was written.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A write to the Call/IceCandidate tables failed. Not retried.
    #[error("Signaling write failed: {0}")]
    SignalingWrite(#[from] SignalingError),

    /// Applying a remote description or candidate failed. The call was ended.
    #[error("Negotiation failed: {0}")]
    Negotiation(MediaError),

    /// The peer (or the row) already ended the call.
    #[error("Call already {0}")]
    RemoteTerminated(EndReason),

    #[error("Media error: {0}")]
    Media(MediaError),

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Upgrade not allowed: {0}")]
    UpgradeNotAllowed(String),

    #[error("User {user} is not a participant in call {call}")]
    NotParticipant { call: Uuid, user: Uuid },

    #[error("Call session closed")]
    SessionClosed,
}

impl CallError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::SignalingWrite(_) => "SIGNALING_WRITE_FAILURE",
            Self::Negotiation(_) => "NEGOTIATION_FAILURE",
            Self::RemoteTerminated(_) => "REMOTE_TERMINATED",
            Self::Media(_) => "MEDIA_ERROR",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::UpgradeNotAllowed(_) => "UPGRADE_NOT_ALLOWED",
            Self::NotParticipant { .. } => "NOT_PARTICIPANT",
            Self::SessionClosed => "SESSION_CLOSED",
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(msg) | MediaError::DeviceUnavailable(msg) => {
                Self::PermissionDenied(msg)
            }
            other => Self::Media(other),
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;
