//! Call model: the shared signaling record.
//!
//! Both participants mutate the same row. There is no central arbiter: the
//! row is eventually consistent and every writer follows two rules:
//! - a terminal `status` is never overwritten
//! - `ended_at` is written at most once

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snowflake::generate_id;

/// A call between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,

    /// The user who placed the call (and created this row).
    pub caller_id: Uuid,

    pub callee_id: Uuid,

    /// Upgraded from `voice` to `video` in place.
    pub call_type: CallType,

    pub status: CallStatus,

    /// Latest offer. Replaced during upgrade renegotiation.
    pub offer: Option<SessionDescription>,

    /// 0 for the establishing offer, incremented by each renegotiation.
    #[serde(default)]
    pub offer_revision: u32,

    pub answer: Option<SessionDescription>,

    /// The offer revision this answer responds to.
    #[serde(default)]
    pub answer_revision: u32,

    pub upgrade_status: UpgradeStatus,

    /// Whichever side asked for the upgrade.
    pub upgrade_requester: Option<Uuid>,

    /// Bumped by every new upgrade request and by a reset after a failed
    /// upgrade. `(upgrade_seq, upgrade_status)` only ever moves forward.
    #[serde(default)]
    pub upgrade_seq: u32,

    /// Set when the answer is produced.
    pub started_at: Option<DateTime<Utc>>,

    /// Set exactly once, at termination.
    pub ended_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Ended,
    Declined,
    Missed,
}

impl CallStatus {
    /// `ended`, `declined` and `missed` are final: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStatus {
    #[default]
    None,
    Requested,
    Accepted,
    Declined,
}

impl UpgradeStatus {
    /// Position within one request: `none` → `requested` → `accepted`/`declined`.
    pub fn progress(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Requested => 1,
            Self::Accepted | Self::Declined => 2,
        }
    }

    /// No request is outstanding.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::None | Self::Declined)
    }
}

/// An opaque negotiated capability descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

impl Call {
    /// A freshly placed call, ringing, with no offer yet.
    pub fn new(caller_id: Uuid, callee_id: Uuid, call_type: CallType) -> Self {
        Self::with_id(generate_id(), caller_id, callee_id, call_type)
    }

    pub fn with_id(id: Uuid, caller_id: Uuid, callee_id: Uuid, call_type: CallType) -> Self {
        Self {
            id,
            caller_id,
            callee_id,
            call_type,
            status: CallStatus::Ringing,
            offer: None,
            offer_revision: 0,
            answer: None,
            answer_revision: 0,
            upgrade_status: UpgradeStatus::None,
            upgrade_requester: None,
            upgrade_seq: 0,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    /// The other side of the call, if `user_id` takes part in it.
    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.caller_id {
            Some(self.callee_id)
        } else if user_id == self.callee_id {
            Some(self.caller_id)
        } else {
            None
        }
    }

    /// Who wrote the current offer. Revision 0 is the caller's establishing
    /// offer; later revisions come from the upgrade requester.
    pub fn offer_author(&self) -> Option<Uuid> {
        self.offer.as_ref()?;
        if self.offer_revision == 0 {
            Some(self.caller_id)
        } else {
            self.upgrade_requester
        }
    }

    /// Apply a patch in place. `ended_at` keeps its first value.
    ///
    /// Conditions are not checked here; see [`PatchCondition::holds`].
    pub fn apply(&mut self, patch: &CallPatch) {
        if let Some(call_type) = patch.call_type {
            self.call_type = call_type;
        }
        if let Some(status) = patch.status {
            if !self.status.is_terminal() {
                self.status = status;
            }
        }
        if let Some(ref offer) = patch.offer {
            self.offer = Some(offer.clone());
        }
        if let Some(rev) = patch.offer_revision {
            self.offer_revision = rev;
        }
        if let Some(ref answer) = patch.answer {
            self.answer = Some(answer.clone());
        }
        if let Some(rev) = patch.answer_revision {
            self.answer_revision = rev;
        }
        if let Some(upgrade) = patch.upgrade_status {
            self.upgrade_status = upgrade;
        }
        if let Some(requester) = patch.upgrade_requester {
            self.upgrade_requester = Some(requester);
        }
        if let Some(seq) = patch.upgrade_seq {
            self.upgrade_seq = seq;
        }
        if let Some(started) = patch.started_at {
            self.started_at.get_or_insert(started);
        }
        if let Some(ended) = patch.ended_at {
            self.ended_at.get_or_insert(ended);
        }
    }
}

/// A partial update to a [`Call`] row. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_revision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_revision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_status: Option<UpgradeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_requester: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_seq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Guard evaluated by the store against the current row.
    #[serde(default)]
    pub condition: PatchCondition,
}

impl CallPatch {
    /// Establishing or renegotiation offer.
    pub fn offer(offer: SessionDescription, revision: u32) -> Self {
        Self {
            offer: Some(offer),
            offer_revision: Some(revision),
            ..Default::default()
        }
    }

    /// Answer to the offer with `revision`.
    pub fn answer(answer: SessionDescription, revision: u32) -> Self {
        Self {
            answer: Some(answer),
            answer_revision: Some(revision),
            ..Default::default()
        }
    }

    /// Terminal status plus the write-once `ended_at`, guarded so it never
    /// overwrites another terminal status.
    pub fn terminate(status: CallStatus, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            ended_at: Some(at),
            condition: PatchCondition::NotTerminal,
            ..Default::default()
        }
    }

    pub fn upgrade(status: UpgradeStatus) -> Self {
        Self {
            upgrade_status: Some(status),
            ..Default::default()
        }
    }

    pub fn when(mut self, condition: PatchCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn is_empty(&self) -> bool {
        let unconditioned = Self {
            condition: self.condition,
            ..Default::default()
        };
        *self == unconditioned
    }
}

/// Precondition for a conditional update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PatchCondition {
    #[default]
    Always,
    /// The row is not in a terminal status yet.
    NotTerminal,
    /// The row has exactly this status.
    StatusIs(CallStatus),
    /// No offer has been written yet.
    NoOffer,
    /// Not terminal, and no upgrade is outstanding at this sequence number.
    UpgradeSettled(u32),
    /// Not terminal, and the request with this sequence number awaits an answer.
    UpgradeRequested(u32),
    /// Not terminal, and the request with this sequence number was accepted.
    UpgradeAccepted(u32),
}

impl PatchCondition {
    pub fn holds(&self, call: &Call) -> bool {
        let live = !call.status.is_terminal();
        match self {
            Self::Always => true,
            Self::NotTerminal => !call.status.is_terminal(),
            Self::StatusIs(status) => call.status == *status,
            Self::NoOffer => call.offer.is_none(),
            Self::UpgradeSettled(seq) => {
                live && call.upgrade_seq == *seq && call.upgrade_status.is_settled()
            }
            Self::UpgradeRequested(seq) => {
                live && call.upgrade_seq == *seq && call.upgrade_status == UpgradeStatus::Requested
            }
            Self::UpgradeAccepted(seq) => {
                live && call.upgrade_seq == *seq && call.upgrade_status == UpgradeStatus::Accepted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ringing() -> Call {
        Call::new(Uuid::now_v7(), Uuid::now_v7(), CallType::Voice)
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Answered.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
    }

    #[test]
    fn test_ended_at_is_write_once() {
        let mut call = ringing();
        let first = Utc::now();
        call.apply(&CallPatch::terminate(CallStatus::Missed, first));
        let later = first + chrono::Duration::seconds(5);
        call.apply(&CallPatch::terminate(CallStatus::Ended, later));

        assert_eq!(call.ended_at, Some(first));
        assert_eq!(call.status, CallStatus::Missed);
    }

    #[test]
    fn test_conditions() {
        let mut call = ringing();
        assert!(PatchCondition::NoOffer.holds(&call));
        assert!(PatchCondition::StatusIs(CallStatus::Ringing).holds(&call));

        call.apply(&CallPatch::offer(SessionDescription::offer("v=0"), 0));
        assert!(!PatchCondition::NoOffer.holds(&call));

        call.apply(&CallPatch {
            status: Some(CallStatus::Declined),
            ..Default::default()
        });
        assert!(!PatchCondition::NotTerminal.holds(&call));
        assert!(PatchCondition::Always.holds(&call));
    }

    #[test]
    fn test_offer_author_follows_revision() {
        let mut call = ringing();
        assert_eq!(call.offer_author(), None);

        call.apply(&CallPatch::offer(SessionDescription::offer("v=0"), 0));
        assert_eq!(call.offer_author(), Some(call.caller_id));

        let callee = call.callee_id;
        call.apply(&CallPatch {
            upgrade_status: Some(UpgradeStatus::Accepted),
            upgrade_requester: Some(callee),
            ..CallPatch::offer(SessionDescription::offer("v=0 video"), 1)
        });
        assert_eq!(call.offer_author(), Some(callee));
    }

    #[test]
    fn test_upgrade_conditions_track_sequence() {
        let mut call = ringing();
        call.apply(&CallPatch {
            status: Some(CallStatus::Answered),
            ..Default::default()
        });
        assert!(PatchCondition::UpgradeSettled(0).holds(&call));
        assert!(!PatchCondition::UpgradeRequested(0).holds(&call));

        call.apply(&CallPatch {
            upgrade_requester: Some(call.caller_id),
            upgrade_seq: Some(1),
            ..CallPatch::upgrade(UpgradeStatus::Requested)
        });
        assert!(PatchCondition::UpgradeRequested(1).holds(&call));
        assert!(!PatchCondition::UpgradeSettled(0).holds(&call));
        assert!(!PatchCondition::UpgradeAccepted(1).holds(&call));

        call.apply(&CallPatch::upgrade(UpgradeStatus::Accepted));
        assert!(PatchCondition::UpgradeAccepted(1).holds(&call));
        assert!(!PatchCondition::UpgradeRequested(1).holds(&call));

        call.apply(&CallPatch::terminate(CallStatus::Ended, Utc::now()));
        assert!(!PatchCondition::UpgradeAccepted(1).holds(&call));
    }

    #[test]
    fn test_wire_format_is_lowercase() {
        let call = ringing();
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["call_type"], "voice");
        assert_eq!(json["status"], "ringing");
        assert_eq!(json["upgrade_status"], "none");

        let desc = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(desc["type"], "answer");
    }

    #[test]
    fn test_patch_is_empty_ignores_condition() {
        assert!(CallPatch::default().is_empty());
        assert!(CallPatch::default().when(PatchCondition::NotTerminal).is_empty());
        assert!(!CallPatch::upgrade(UpgradeStatus::Requested).is_empty());
    }

    #[test]
    fn test_peer_of() {
        let call = ringing();
        assert_eq!(call.peer_of(call.caller_id), Some(call.callee_id));
        assert_eq!(call.peer_of(call.callee_id), Some(call.caller_id));
        assert_eq!(call.peer_of(Uuid::now_v7()), None);
    }
}
