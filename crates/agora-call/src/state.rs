//! Call state: the per-device lifecycle and upgrade sub-state.
//!
//! The main lifecycle:
//! - caller: `Idle → Initiating → AwaitingAnswer → Connected → Ended`
//! - callee: `Idle → AnsweringOffer → Connected → Ended`
//!
//! `Ended` is final. The upgrade sub-state only moves while `Connected`.

use crate::media::{IceConnectionState, MediaTrack};
use agora_common::models::{CallStatus, UpgradeStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of the call this device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a call ended. Mirrors the terminal [`CallStatus`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Ended,
    Declined,
    Missed,
}

impl EndReason {
    /// The terminal reason carried by `status`, if any.
    pub fn from_status(status: CallStatus) -> Option<Self> {
        match status {
            CallStatus::Ended => Some(Self::Ended),
            CallStatus::Declined => Some(Self::Declined),
            CallStatus::Missed => Some(Self::Missed),
            CallStatus::Ringing | CallStatus::Answered => None,
        }
    }

    pub fn as_status(self) -> CallStatus {
        match self {
            Self::Ended => CallStatus::Ended,
            Self::Declined => CallStatus::Declined,
            Self::Missed => CallStatus::Missed,
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_status().as_str())
    }
}

/// Main lifecycle phase of one call on this device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum CallPhase {
    #[default]
    Idle,
    /// Caller is producing the establishing offer.
    Initiating,
    /// Offer written, waiting for the callee's answer.
    AwaitingAnswer,
    /// Callee is answering the caller's offer.
    AnsweringOffer,
    Connected,
    Ended(EndReason),
}

impl CallPhase {
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Ended(_))
    }

    pub fn end_reason(self) -> Option<EndReason> {
        match self {
            Self::Ended(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Voice → video renegotiation sub-state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradePhase {
    #[default]
    None,
    Requested,
    Accepted,
    Declined,
}

impl UpgradePhase {
    /// Ordering within one request, matching [`UpgradeStatus::progress`].
    pub fn progress(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Requested => 1,
            Self::Accepted | Self::Declined => 2,
        }
    }

    /// No request is outstanding, so a new one may be made.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::None | Self::Declined)
    }
}

impl From<UpgradeStatus> for UpgradePhase {
    fn from(status: UpgradeStatus) -> Self {
        match status {
            UpgradeStatus::None => Self::None,
            UpgradeStatus::Requested => Self::Requested,
            UpgradeStatus::Accepted => Self::Accepted,
            UpgradeStatus::Declined => Self::Declined,
        }
    }
}

/// Something the engine wants observers (the controller, a UI) to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    PhaseChanged(CallPhase),
    /// The peer asked to upgrade to video. Never auto-accepted.
    UpgradePrompt { requester: Uuid },
    /// Our upgrade request was declined.
    UpgradeDeclined,
    /// Video was added to the session.
    Upgraded,
    /// Renegotiation could not run; the voice session continues.
    UpgradeFailed(String),
    RemoteTrack(MediaTrack),
    IceStateChanged(IceConnectionState),
    /// Transport dropped; media may recover.
    ConnectionDegraded,
    ConnectionRestored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_round_trips_terminal_statuses() {
        for status in [CallStatus::Ended, CallStatus::Declined, CallStatus::Missed] {
            let reason = EndReason::from_status(status).unwrap();
            assert_eq!(reason.as_status(), status);
        }
        assert_eq!(EndReason::from_status(CallStatus::Ringing), None);
        assert_eq!(EndReason::from_status(CallStatus::Answered), None);
    }

    #[test]
    fn test_phase_serializes_with_reason() {
        let json = serde_json::to_value(CallPhase::Ended(EndReason::Missed)).unwrap();
        assert_eq!(json["phase"], "ended");
        assert_eq!(json["reason"], "missed");
        assert_eq!(CallPhase::Ended(EndReason::Declined).end_reason(), Some(EndReason::Declined));
        assert!(!CallPhase::Connected.is_ended());
    }
}
