//! Call signaling engine: one call's lifecycle on one device.
//!
//! The engine reconciles local intents (start, answer, upgrade, hang up)
//! with row changes and candidate inserts arriving from the signaling
//! channel. Deliveries may repeat and arrive out of order; every handler is
//! idempotent and a terminal status always wins.
//!
//! Renegotiation is a full offer/answer round trip. Each offer carries a
//! revision: 0 establishes the session, each upgrade writes the next one,
//! and an answer names the revision it responds to.
//!
//! The upgrade flag is ordered by `(upgrade_seq, upgrade_status)`. A row
//! behind what this device has already seen or written leaves the upgrade
//! sub-state alone, and every upgrade write is conditioned on the request
//! it belongs to.
//!
//! The engine is not thread-safe and does not need to be: it is owned by a
//! single actor task (see [`crate::controller`]) which feeds it one event
//! at a time.

use crate::error::{CallError, CallResult};
use crate::media::{IceConnectionState, MediaError, MediaEvent, MediaSessionBinding};
use crate::state::{CallPhase, CallRole, EndReason, EngineEvent, UpgradePhase};
use agora_common::models::{
    Call, CallPatch, CallStatus, CallType, IceCandidate, PatchCondition, SessionDescription,
    UpgradeStatus,
};
use agora_common::SignalingError;
use agora_signaling::SignalingChannel;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub struct CallSignalingEngine<M: MediaSessionBinding> {
    call_id: Uuid,
    self_id: Uuid,
    peer_id: Uuid,
    role: CallRole,
    call_type: CallType,
    phase: CallPhase,

    upgrade: UpgradePhase,
    upgrade_requester: Option<Uuid>,
    /// Sequence number of the upgrade request `upgrade` belongs to.
    upgrade_seq: u32,

    media: M,
    signaling: Arc<dyn SignalingChannel>,

    /// Establishing offer written (caller only).
    offer_sent: bool,
    /// Revision of the last offer this device wrote.
    local_offer_revision: Option<u32>,
    /// Last answer revision applied as remote description.
    applied_answer_revision: Option<u32>,
    /// Last remote offer revision answered.
    applied_offer_revision: Option<u32>,
    /// Highest offer revision seen on the row.
    latest_offer_revision: u32,

    /// Remote candidates waiting for a remote description, in arrival order.
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<Uuid>,

    /// Our accepted upgrade is being renegotiated.
    upgrade_in_progress: bool,
    /// Request whose renegotiation was attempted.
    renegotiated_seq: Option<u32>,
    degraded: bool,
    termination_written: bool,

    events: Vec<EngineEvent>,
}

impl<M: MediaSessionBinding> CallSignalingEngine<M> {
    /// Engine for `call` as seen by `self_id`.
    pub fn new(
        call: &Call,
        self_id: Uuid,
        media: M,
        signaling: Arc<dyn SignalingChannel>,
    ) -> CallResult<Self> {
        let Some(peer_id) = call.peer_of(self_id) else {
            return Err(CallError::NotParticipant {
                call: call.id,
                user: self_id,
            });
        };
        let role = if self_id == call.caller_id {
            CallRole::Caller
        } else {
            CallRole::Callee
        };

        Ok(Self {
            call_id: call.id,
            self_id,
            peer_id,
            role,
            call_type: call.call_type,
            phase: CallPhase::Idle,
            upgrade: UpgradePhase::None,
            upgrade_requester: None,
            upgrade_seq: call.upgrade_seq,
            media,
            signaling,
            offer_sent: false,
            local_offer_revision: None,
            applied_answer_revision: None,
            applied_offer_revision: None,
            latest_offer_revision: call.offer_revision,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            upgrade_in_progress: false,
            renegotiated_seq: None,
            degraded: false,
            termination_written: false,
            events: Vec::new(),
        })
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn upgrade(&self) -> UpgradePhase {
        self.upgrade
    }

    pub fn upgrade_requester(&self) -> Option<Uuid> {
        self.upgrade_requester
    }

    pub fn upgrade_seq(&self) -> u32 {
        self.upgrade_seq
    }

    pub fn is_upgrade_in_progress(&self) -> bool {
        self.upgrade_in_progress
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    /// Events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Local intents ───────────────────────────────────────────────────────

    /// Create the establishing offer and write it to the row.
    ///
    /// A no-op once an offer was sent or the call moved past `Initiating`.
    pub async fn start_as_caller(&mut self) -> CallResult<()> {
        if self.role != CallRole::Caller {
            return Err(CallError::InvalidState("only the caller sends the offer".into()));
        }
        if self.offer_sent || !matches!(self.phase, CallPhase::Idle | CallPhase::Initiating) {
            tracing::debug!(call = %self.call_id, phase = ?self.phase, "Offer already sent");
            return Ok(());
        }
        if self.media.local_stream().is_none() {
            return Err(CallError::InvalidState("local media not acquired".into()));
        }

        self.set_phase(CallPhase::Initiating);

        let offer = match self.media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail_negotiation(e).await),
        };

        let patch = CallPatch::offer(offer, 0).when(PatchCondition::NoOffer);
        if let Err(e) = self.signaling.update_call(self.call_id, patch).await {
            return Err(self.write_failed(e).await);
        }

        self.offer_sent = true;
        self.local_offer_revision = Some(0);
        self.set_phase(CallPhase::AwaitingAnswer);
        tracing::info!(call = %self.call_id, user = %self.self_id, "Offer sent");
        Ok(())
    }

    /// Answer the caller's offer and mark the call answered.
    pub async fn accept_as_callee(&mut self, remote_offer: &SessionDescription) -> CallResult<()> {
        if self.role != CallRole::Callee {
            return Err(CallError::InvalidState("only the callee answers".into()));
        }
        if self.phase != CallPhase::Idle {
            tracing::debug!(call = %self.call_id, phase = ?self.phase, "Already answering");
            return Ok(());
        }
        if self.media.local_stream().is_none() {
            return Err(CallError::InvalidState("local media not acquired".into()));
        }

        self.set_phase(CallPhase::AnsweringOffer);

        let answer = match self.media.create_answer(remote_offer).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_negotiation(e).await),
        };
        self.applied_offer_revision = Some(0);
        self.flush_pending_candidates().await?;

        let patch = CallPatch {
            status: Some(CallStatus::Answered),
            started_at: Some(Utc::now()),
            ..CallPatch::answer(answer, 0)
        }
        .when(PatchCondition::StatusIs(CallStatus::Ringing));
        if let Err(e) = self.signaling.update_call(self.call_id, patch).await {
            return Err(self.write_failed(e).await);
        }

        self.set_phase(CallPhase::Connected);
        tracing::info!(call = %self.call_id, user = %self.self_id, "Call answered");
        Ok(())
    }

    /// Ask the peer to upgrade this voice call to video.
    ///
    /// Rejected without a write unless connected on a voice call with no
    /// request outstanding.
    pub async fn request_upgrade(&mut self) -> CallResult<()> {
        if self.phase != CallPhase::Connected {
            return Err(CallError::UpgradeNotAllowed(format!(
                "call is {:?}, not connected",
                self.phase
            )));
        }
        if self.call_type != CallType::Voice {
            return Err(CallError::UpgradeNotAllowed("call already has video".into()));
        }
        if !self.upgrade.is_settled() {
            return Err(CallError::UpgradeNotAllowed("an upgrade is already pending".into()));
        }

        let seq = self.upgrade_seq + 1;
        let patch = CallPatch {
            upgrade_requester: Some(self.self_id),
            upgrade_seq: Some(seq),
            ..CallPatch::upgrade(UpgradeStatus::Requested)
        }
        .when(PatchCondition::UpgradeSettled(self.upgrade_seq));
        match self.signaling.update_call(self.call_id, patch).await {
            Ok(_) => {}
            Err(SignalingError::ConditionFailed { current }) if !current.status.is_terminal() => {
                return Err(CallError::UpgradeNotAllowed(format!(
                    "upgrade state moved on (request {}, {:?})",
                    current.upgrade_seq, current.upgrade_status
                )));
            }
            Err(e) => return Err(self.write_failed(e).await),
        }

        self.upgrade = UpgradePhase::Requested;
        self.upgrade_requester = Some(self.self_id);
        self.upgrade_seq = seq;
        tracing::info!(call = %self.call_id, user = %self.self_id, seq, "Video upgrade requested");
        Ok(())
    }

    /// Accept or decline the peer's pending upgrade request.
    ///
    /// Only flips the flag. The requester then sends the new offer.
    pub async fn respond_to_upgrade(&mut self, accept: bool) -> CallResult<()> {
        let pending_from_peer = self.upgrade == UpgradePhase::Requested
            && self.upgrade_requester == Some(self.peer_id);
        if self.phase != CallPhase::Connected || !pending_from_peer {
            return Err(CallError::UpgradeNotAllowed(
                "no upgrade request from the peer is pending".into(),
            ));
        }

        let (status, phase) = if accept {
            (UpgradeStatus::Accepted, UpgradePhase::Accepted)
        } else {
            (UpgradeStatus::Declined, UpgradePhase::Declined)
        };
        let patch = CallPatch::upgrade(status).when(PatchCondition::UpgradeRequested(self.upgrade_seq));
        match self.signaling.update_call(self.call_id, patch).await {
            Ok(_) => {}
            Err(SignalingError::ConditionFailed { current }) if !current.status.is_terminal() => {
                return Err(CallError::UpgradeNotAllowed(
                    "the upgrade request is no longer pending".into(),
                ));
            }
            Err(e) => return Err(self.write_failed(e).await),
        }

        self.upgrade = phase;
        tracing::info!(call = %self.call_id, seq = self.upgrade_seq, accepted = accept, "Responded to upgrade request");
        Ok(())
    }

    /// End the call with `reason`.
    ///
    /// Writes the terminal status and `ended_at` at most once, then releases
    /// the media session. Later calls are no-ops.
    pub async fn terminate(&mut self, reason: EndReason) -> CallResult<()> {
        if self.phase.is_ended() || self.termination_written {
            tracing::debug!(call = %self.call_id, "Already terminated");
            return Ok(());
        }
        self.termination_written = true;

        let patch = CallPatch::terminate(reason.as_status(), Utc::now());
        let result = match self.signaling.update_call(self.call_id, patch).await {
            Ok(_) => Ok(()),
            Err(SignalingError::ConditionFailed { current }) => {
                // Ended elsewhere first; that reason stands.
                if let Some(remote) = EndReason::from_status(current.status) {
                    self.finish(remote).await;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(call = %self.call_id, error = %e, "Failed to write termination");
                Err(CallError::SignalingWrite(e))
            }
        };

        self.finish(reason).await;
        result
    }

    // ── Remote events ───────────────────────────────────────────────────────

    /// Reconcile a delivery of the call row.
    ///
    /// Rules, first match wins:
    /// 1. terminal status → `Ended(status)`
    /// 2. answer to our outstanding offer → apply it
    /// 3. renegotiation offer from the peer → answer it
    /// 4. upgrade requested by the peer → prompt
    /// 5. our upgrade accepted → renegotiate, once
    /// 6. our upgrade declined → notice
    pub async fn on_remote_call_update(&mut self, call: &Call) -> CallResult<()> {
        if call.id != self.call_id {
            return Ok(());
        }
        if self.phase.is_ended() {
            tracing::debug!(call = %self.call_id, status = %call.status, "Delivery after end ignored");
            return Ok(());
        }

        if let Some(reason) = EndReason::from_status(call.status) {
            tracing::info!(call = %self.call_id, reason = %reason, "Call ended remotely");
            self.finish(reason).await;
            return Ok(());
        }

        self.latest_offer_revision = self.latest_offer_revision.max(call.offer_revision);
        let previous_upgrade = self.upgrade;
        let mut upgrade_changed = false;
        if self.phase == CallPhase::Connected {
            // Voice only ever becomes video.
            if call.call_type == CallType::Video {
                self.call_type = CallType::Video;
            }
            if self.is_newer_upgrade(call) {
                self.upgrade_seq = call.upgrade_seq;
                self.upgrade = call.upgrade_status.into();
                self.upgrade_requester = call.upgrade_requester;
                upgrade_changed = true;
            }
        }

        if let Some(revision) = self.answer_to_apply(call) {
            let Some(answer) = call.answer.as_ref() else {
                return Ok(());
            };
            if let Err(e) = self.media.set_remote_description(answer).await {
                return Err(self.fail_negotiation(e).await);
            }
            self.applied_answer_revision = Some(revision);
            self.flush_pending_candidates().await?;

            if revision == 0 {
                self.set_phase(CallPhase::Connected);
                tracing::info!(call = %self.call_id, "Answer applied, call connected");
            } else {
                self.upgrade_in_progress = false;
                self.call_type = CallType::Video;
                self.events.push(EngineEvent::Upgraded);
                tracing::info!(call = %self.call_id, revision, "Upgrade answer applied");
            }
        } else if self.is_renegotiation_offer(call) {
            self.answer_renegotiation(call).await?;
        } else if self.phase != CallPhase::Connected {
            // Upgrade sub-state is only reachable while connected.
        } else if self.upgrade == UpgradePhase::Requested
            && self.upgrade_requester == Some(self.peer_id)
        {
            if upgrade_changed {
                tracing::info!(call = %self.call_id, requester = %self.peer_id, "Upgrade prompt");
                self.events.push(EngineEvent::UpgradePrompt {
                    requester: self.peer_id,
                });
            }
        } else if self.upgrade == UpgradePhase::Accepted
            && self.upgrade_requester == Some(self.self_id)
        {
            if self.renegotiated_seq != Some(self.upgrade_seq) && !self.upgrade_in_progress {
                self.perform_upgrade_renegotiation().await?;
            }
        } else if self.upgrade == UpgradePhase::Declined
            && self.upgrade_requester == Some(self.self_id)
            && upgrade_changed
        {
            tracing::info!(call = %self.call_id, "Upgrade declined by peer");
            self.events.push(EngineEvent::UpgradeDeclined);
        } else if self.upgrade == UpgradePhase::None
            && previous_upgrade == UpgradePhase::Accepted
            && upgrade_changed
        {
            tracing::info!(call = %self.call_id, "Peer abandoned the upgrade");
            self.events
                .push(EngineEvent::UpgradeFailed("peer could not start video".into()));
        }

        Ok(())
    }

    /// Apply a candidate published by the peer, or buffer it until a remote
    /// description exists.
    pub async fn on_remote_ice_candidate(&mut self, candidate: IceCandidate) -> CallResult<()> {
        if candidate.call_id != self.call_id
            || candidate.sender_id == self.self_id
            || self.phase.is_ended()
        {
            return Ok(());
        }
        if !self.seen_candidates.insert(candidate.id) {
            tracing::debug!(call = %self.call_id, candidate = %candidate.id, "Duplicate candidate");
            return Ok(());
        }

        if !self.media.has_remote_description() {
            tracing::debug!(
                call = %self.call_id,
                buffered = self.pending_candidates.len() + 1,
                "Candidate buffered until remote description is set"
            );
            self.pending_candidates.push(candidate);
            return Ok(());
        }

        if let Err(e) = self.media.add_ice_candidate(&candidate).await {
            return Err(self.fail_negotiation(e).await);
        }
        Ok(())
    }

    /// React to a media engine notification.
    pub async fn on_media_event(&mut self, event: MediaEvent) -> CallResult<()> {
        if self.phase.is_ended() {
            return Ok(());
        }

        match event {
            MediaEvent::LocalCandidate(local) => {
                let mut candidate = IceCandidate::new(self.call_id, self.self_id, local.candidate);
                candidate.sdp_mid = local.sdp_mid;
                candidate.sdp_m_line_index = local.sdp_m_line_index;
                self.signaling.insert_candidate(candidate).await?;
            }
            MediaEvent::RemoteTrack(track) => {
                tracing::debug!(call = %self.call_id, kind = ?track.kind, "Remote track");
                self.events.push(EngineEvent::RemoteTrack(track));
            }
            MediaEvent::IceConnectionStateChanged(state) => {
                self.events.push(EngineEvent::IceStateChanged(state));
                match state {
                    IceConnectionState::Failed if self.phase == CallPhase::Connected => {
                        tracing::error!(call = %self.call_id, "ICE connection failed");
                        self.terminate(EndReason::Ended).await?;
                    }
                    IceConnectionState::Failed => {
                        tracing::warn!(call = %self.call_id, phase = ?self.phase, "ICE failed before connect");
                    }
                    IceConnectionState::Disconnected if !self.degraded => {
                        tracing::warn!(call = %self.call_id, "Connection degraded");
                        self.degraded = true;
                        self.events.push(EngineEvent::ConnectionDegraded);
                    }
                    s if s.is_up() && self.degraded => {
                        tracing::info!(call = %self.call_id, "Connection restored");
                        self.degraded = false;
                        self.events.push(EngineEvent::ConnectionRestored);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // ── Renegotiation ───────────────────────────────────────────────────────

    /// Add video to the live session and offer it to the peer.
    ///
    /// Runs once per accepted request. A missing camera is reported as an
    /// upgrade failure and the voice session continues.
    pub async fn perform_upgrade_renegotiation(&mut self) -> CallResult<()> {
        if self.upgrade != UpgradePhase::Accepted || self.upgrade_requester != Some(self.self_id) {
            return Err(CallError::UpgradeNotAllowed(
                "no accepted upgrade request of ours".into(),
            ));
        }
        let seq = self.upgrade_seq;
        if self.upgrade_in_progress || self.renegotiated_seq == Some(seq) {
            return Ok(());
        }
        self.upgrade_in_progress = true;
        self.renegotiated_seq = Some(seq);

        let track = match self.media.acquire_video_track().await {
            Ok(track) => track,
            Err(e) => return self.abandon_upgrade(e).await,
        };
        if let Err(e) = self.media.add_track(track).await {
            return self.abandon_upgrade(e).await;
        }
        let offer = match self.media.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return self.abandon_upgrade(e).await,
        };

        let revision = self.latest_offer_revision + 1;
        let patch = CallPatch {
            call_type: Some(CallType::Video),
            ..CallPatch::offer(offer, revision)
        }
        .when(PatchCondition::UpgradeAccepted(seq));
        if let Err(e) = self.signaling.update_call(self.call_id, patch).await {
            self.upgrade_in_progress = false;
            return Err(self.write_failed(e).await);
        }

        self.local_offer_revision = Some(revision);
        self.latest_offer_revision = revision;
        tracing::info!(call = %self.call_id, revision, "Renegotiation offer sent");
        Ok(())
    }

    /// Answer the peer's renegotiation offer, sending our camera if we can.
    async fn answer_renegotiation(&mut self, call: &Call) -> CallResult<()> {
        let Some(offer) = call.offer.as_ref() else {
            return Ok(());
        };
        let revision = call.offer_revision;

        match self.media.acquire_video_track().await {
            Ok(track) => {
                if let Err(e) = self.media.add_track(track).await {
                    tracing::warn!(call = %self.call_id, error = %e, "Could not add camera, receiving only");
                }
            }
            Err(e) => {
                tracing::warn!(call = %self.call_id, error = %e, "No camera, receiving video only");
            }
        }

        let answer = match self.media.create_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_negotiation(e).await),
        };
        self.applied_offer_revision = Some(revision);
        self.flush_pending_candidates().await?;

        let patch = CallPatch::answer(answer, revision).when(PatchCondition::NotTerminal);
        if let Err(e) = self.signaling.update_call(self.call_id, patch).await {
            return Err(self.write_failed(e).await);
        }

        self.call_type = CallType::Video;
        self.events.push(EngineEvent::Upgraded);
        tracing::info!(call = %self.call_id, revision, "Renegotiation answered");
        Ok(())
    }

    /// Our accepted upgrade cannot run. Reset the flag under a new sequence
    /// number so both sides may ask again, and stay on voice.
    async fn abandon_upgrade(&mut self, err: MediaError) -> CallResult<()> {
        tracing::warn!(call = %self.call_id, error = %err, "Upgrade failed, staying on voice");
        self.upgrade_in_progress = false;
        self.events.push(EngineEvent::UpgradeFailed(err.to_string()));

        let seq = self.upgrade_seq + 1;
        let patch = CallPatch {
            upgrade_seq: Some(seq),
            ..CallPatch::upgrade(UpgradeStatus::None)
        }
        .when(PatchCondition::UpgradeAccepted(self.upgrade_seq));
        if let Err(e) = self.signaling.update_call(self.call_id, patch).await {
            return Err(self.write_failed(e).await);
        }

        self.upgrade = UpgradePhase::None;
        self.upgrade_seq = seq;
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Revision of an unapplied answer to our own latest offer.
    fn answer_to_apply(&self, call: &Call) -> Option<u32> {
        let revision = self.local_offer_revision?;
        call.answer.as_ref()?;
        if call.answer_revision != revision || self.applied_answer_revision >= Some(revision) {
            return None;
        }
        if revision == 0 && self.media.has_remote_description() {
            return None;
        }
        Some(revision)
    }

    /// The row's upgrade flag is ahead of what this device already knows.
    fn is_newer_upgrade(&self, call: &Call) -> bool {
        (call.upgrade_seq, call.upgrade_status.progress()) > (self.upgrade_seq, self.upgrade.progress())
    }

    fn is_renegotiation_offer(&self, call: &Call) -> bool {
        self.phase == CallPhase::Connected
            && call.offer.is_some()
            && call.offer_revision > 0
            && call.offer_author() == Some(self.peer_id)
            && self
                .applied_offer_revision
                .is_none_or(|applied| applied < call.offer_revision)
    }

    async fn flush_pending_candidates(&mut self) -> CallResult<()> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        tracing::debug!(call = %self.call_id, count = pending.len(), "Flushing buffered candidates");
        for candidate in pending {
            if let Err(e) = self.media.add_ice_candidate(&candidate).await {
                return Err(self.fail_negotiation(e).await);
            }
        }
        Ok(())
    }

    /// A description or candidate could not be applied: end the call.
    async fn fail_negotiation(&mut self, err: MediaError) -> CallError {
        tracing::error!(call = %self.call_id, error = %err, "Negotiation failed, ending call");
        if let Err(e) = self.terminate(EndReason::Ended).await {
            tracing::warn!(call = %self.call_id, error = %e, "Termination after negotiation failure not written");
        }
        CallError::Negotiation(err)
    }

    /// Map a rejected write. A row that is already terminal ends the call here too.
    async fn write_failed(&mut self, err: SignalingError) -> CallError {
        if let SignalingError::ConditionFailed { current } = &err {
            if let Some(reason) = EndReason::from_status(current.status) {
                self.finish(reason).await;
                return CallError::RemoteTerminated(reason);
            }
        }
        tracing::warn!(call = %self.call_id, error = %err, "Signaling write failed");
        CallError::SignalingWrite(err)
    }

    /// Enter `Ended(reason)` and release media. Idempotent.
    async fn finish(&mut self, reason: EndReason) {
        if self.phase.is_ended() {
            return;
        }
        self.upgrade_in_progress = false;
        self.pending_candidates.clear();
        self.media.close().await;
        self.set_phase(CallPhase::Ended(reason));
        tracing::info!(call = %self.call_id, user = %self.self_id, reason = %reason, "Call ended");
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if self.phase == phase {
            return;
        }
        tracing::debug!(call = %self.call_id, from = ?self.phase, to = ?phase, "Phase change");
        self.phase = phase;
        self.events.push(EngineEvent::PhaseChanged(phase));
    }
}
