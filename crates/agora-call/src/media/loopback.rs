//! Loopback media binding: a media engine stand-in with no real devices.
//!
//! Produces well-formed session descriptions, discovers fake host
//! candidates, reports remote tracks from the m-lines the peer sends, and
//! walks ICE through `checking → connected` once both descriptions are set.
//! A [`LoopbackControl`] handle inspects the session and injects faults
//! (denied permissions, failing negotiation, connectivity changes).

use super::{
    IceConnectionState, LocalCandidate, LocalStream, MediaError, MediaEvent, MediaSessionBinding,
    MediaStream, MediaTrack, RemoteStream, TrackKind,
};
use agora_common::models::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Host candidates announced per local description.
const HOST_CANDIDATES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    fn parse(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    label: String,
    local: Option<LocalStream>,
    remote: Option<RemoteStream>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<String>,
    remote_descriptions_applied: usize,
    offers_created: usize,
    session_version: u64,
    candidate_seq: u32,
    ice_state: IceConnectionState,
    speakerphone: bool,
    closed: bool,

    deny_permission: bool,
    camera_unavailable: bool,
    fail_remote_description: bool,
    fail_candidates: bool,
}

fn lock(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`MediaSessionBinding`].
pub struct LoopbackMedia {
    state: Arc<Mutex<LoopbackState>>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<MediaEvent>>,
}

/// Test and demo handle onto a [`LoopbackMedia`].
#[derive(Clone)]
pub struct LoopbackControl {
    state: Arc<Mutex<LoopbackState>>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
}

impl LoopbackMedia {
    pub fn new(label: impl Into<String>) -> (Self, LoopbackControl) {
        let state = Arc::new(Mutex::new(LoopbackState {
            label: label.into(),
            ..Default::default()
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = LoopbackControl {
            state: Arc::clone(&state),
            events_tx: events_tx.clone(),
        };
        let media = Self {
            state,
            events_tx,
            events_rx: Some(events_rx),
        };
        (media, control)
    }

    fn emit(&self, event: MediaEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Render a description of what this side sends and receives.
    fn describe(
        &self,
        state: &mut LoopbackState,
        sdp_type: SdpType,
        sections: &[(TrackKind, Direction)],
    ) -> SessionDescription {
        state.session_version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n",
            session_id(&state.label),
            state.session_version,
            state.label
        );
        for (mid, (kind, direction)) in sections.iter().enumerate() {
            let (media, payload) = match kind {
                TrackKind::Audio => ("audio", 111),
                TrackKind::Video => ("video", 96),
            };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{mid}\r\na={}\r\n",
                direction.as_str()
            ));
        }
        SessionDescription {
            sdp_type,
            sdp,
        }
    }

    /// Announce host candidates the first time a local description exists.
    fn discover_candidates(&self, state: &mut LoopbackState) {
        if state.candidate_seq > 0 {
            return;
        }
        let host = 10 + (session_id(&state.label) % 200);
        for n in 0..HOST_CANDIDATES {
            state.candidate_seq += 1;
            self.emit(MediaEvent::LocalCandidate(LocalCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 192.0.2.{host} {} typ host",
                    state.candidate_seq,
                    50_000 + n
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }));
        }
    }

    fn apply_remote(
        &self,
        state: &mut LoopbackState,
        desc: &SessionDescription,
    ) -> Result<(), MediaError> {
        if state.closed {
            return Err(MediaError::Closed);
        }
        if state.fail_remote_description {
            return Err(MediaError::Negotiation(
                "remote description rejected".into(),
            ));
        }

        state.remote_description = Some(desc.clone());
        state.remote_descriptions_applied += 1;

        let label = state.label.clone();
        let remote = state
            .remote
            .get_or_insert_with(|| MediaStream::new(format!("{label}-remote")));
        for (kind, direction) in parse_sections(&desc.sdp) {
            if direction.sends() && !remote.has(kind) {
                let track = MediaTrack::new(format!("{label}-remote-{kind:?}").to_lowercase(), kind);
                remote.tracks.push(track.clone());
                self.emit(MediaEvent::RemoteTrack(track));
            }
        }
        Ok(())
    }

    fn maybe_connect(&self, state: &mut LoopbackState) {
        if state.ice_state != IceConnectionState::New
            || state.local_description.is_none()
            || state.remote_description.is_none()
        {
            return;
        }
        for next in [IceConnectionState::Checking, IceConnectionState::Connected] {
            state.ice_state = next;
            self.emit(MediaEvent::IceConnectionStateChanged(next));
        }
    }
}

#[async_trait]
impl MediaSessionBinding for LoopbackMedia {
    async fn acquire_local_media(&mut self, video_enabled: bool) -> Result<LocalStream, MediaError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(MediaError::Closed);
        }
        if state.deny_permission {
            return Err(MediaError::PermissionDenied("microphone access denied".into()));
        }
        if video_enabled && state.camera_unavailable {
            return Err(MediaError::DeviceUnavailable("no camera".into()));
        }

        let label = state.label.clone();
        let mut stream = MediaStream::new(format!("{label}-local"));
        stream
            .tracks
            .push(MediaTrack::new(format!("{label}-audio"), TrackKind::Audio));
        if video_enabled {
            stream
                .tracks
                .push(MediaTrack::new(format!("{label}-video"), TrackKind::Video));
        }
        state.local = Some(stream.clone());
        Ok(stream)
    }

    async fn acquire_video_track(&mut self) -> Result<MediaTrack, MediaError> {
        let state = lock(&self.state);
        if state.deny_permission {
            return Err(MediaError::PermissionDenied("camera access denied".into()));
        }
        if state.camera_unavailable {
            return Err(MediaError::DeviceUnavailable("no camera".into()));
        }
        Ok(MediaTrack::new(
            format!("{}-video", state.label),
            TrackKind::Video,
        ))
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(MediaError::Closed);
        }
        let Some(local) = state.local.as_ref() else {
            return Err(MediaError::InvalidState("no local media".into()));
        };

        let mut sections: Vec<(TrackKind, Direction)> = [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .filter(|kind| local.has(*kind))
            .map(|kind| (kind, Direction::SendRecv))
            .collect();
        // Keep receiving what the peer already sends.
        if let Some(remote) = state.remote.as_ref() {
            for track in &remote.tracks {
                if !sections.iter().any(|(kind, _)| *kind == track.kind) {
                    sections.push((track.kind, Direction::RecvOnly));
                }
            }
        }

        let offer = self.describe(&mut state, SdpType::Offer, &sections);
        state.local_description = Some(offer.clone());
        state.offers_created += 1;
        self.discover_candidates(&mut state);
        self.maybe_connect(&mut state);
        Ok(offer)
    }

    async fn create_answer(
        &mut self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        let mut state = lock(&self.state);
        if remote_offer.sdp_type != SdpType::Offer {
            return Err(MediaError::Negotiation("expected an offer".into()));
        }
        self.apply_remote(&mut state, remote_offer)?;

        let local_kinds: Vec<TrackKind> = state
            .local
            .as_ref()
            .map(|s| s.tracks.iter().map(|t| t.kind).collect())
            .unwrap_or_default();
        let sections: Vec<(TrackKind, Direction)> = parse_sections(&remote_offer.sdp)
            .into_iter()
            .map(|(kind, remote_dir)| {
                let sending = local_kinds.contains(&kind);
                let receiving = remote_dir.sends();
                let dir = match (sending, receiving) {
                    (true, true) => Direction::SendRecv,
                    (true, false) => Direction::SendOnly,
                    (false, true) => Direction::RecvOnly,
                    (false, false) => Direction::Inactive,
                };
                (kind, dir)
            })
            .collect();

        let answer = self.describe(&mut state, SdpType::Answer, &sections);
        state.local_description = Some(answer.clone());
        self.discover_candidates(&mut state);
        self.maybe_connect(&mut state);
        Ok(answer)
    }

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        self.apply_remote(&mut state, desc)?;
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        if state.remote_description.is_none() {
            return Err(MediaError::InvalidState(
                "candidate before remote description".into(),
            ));
        }
        if state.fail_candidates {
            return Err(MediaError::Negotiation(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        state.applied_candidates.push(candidate.candidate.clone());
        Ok(())
    }

    async fn add_track(&mut self, track: MediaTrack) -> Result<(), MediaError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(MediaError::Closed);
        }
        let Some(local) = state.local.as_mut() else {
            return Err(MediaError::InvalidState("no local media".into()));
        };
        if !local.has(track.kind) {
            local.tracks.push(track);
        }
        Ok(())
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool {
        let mut state = lock(&self.state);
        let Some(track) = state
            .local
            .as_mut()
            .and_then(|s| s.tracks.iter_mut().find(|t| t.kind == kind))
        else {
            return false;
        };
        track.enabled = enabled;
        true
    }

    fn set_speakerphone(&mut self, enabled: bool) {
        lock(&self.state).speakerphone = enabled;
    }

    fn has_remote_description(&self) -> bool {
        lock(&self.state).remote_description.is_some()
    }

    fn local_stream(&self) -> Option<LocalStream> {
        lock(&self.state).local.clone()
    }

    fn remote_stream(&self) -> Option<RemoteStream> {
        lock(&self.state).remote.clone()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        lock(&self.state).ice_state
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.take()
    }

    async fn close(&mut self) {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.closed = true;
        for stream in [state.local.as_mut(), state.remote.as_mut()].into_iter().flatten() {
            for track in &mut stream.tracks {
                track.enabled = false;
            }
        }
        state.ice_state = IceConnectionState::Closed;
        self.emit(MediaEvent::IceConnectionStateChanged(IceConnectionState::Closed));
        tracing::debug!(device = %state.label, "Loopback media closed");
    }
}

impl LoopbackControl {
    /// Fail every subsequent acquisition with `PermissionDenied`.
    pub fn deny_permission(&self) {
        lock(&self.state).deny_permission = true;
    }

    /// Fail camera acquisition with `DeviceUnavailable`.
    pub fn camera_unavailable(&self) {
        lock(&self.state).camera_unavailable = true;
    }

    pub fn fail_remote_description(&self) {
        lock(&self.state).fail_remote_description = true;
    }

    pub fn fail_candidates(&self) {
        lock(&self.state).fail_candidates = true;
    }

    /// Drive the transport to `next`, as the native callback would.
    pub fn set_ice_state(&self, next: IceConnectionState) {
        lock(&self.state).ice_state = next;
        let _ = self
            .events_tx
            .send(MediaEvent::IceConnectionStateChanged(next));
    }

    pub fn ice_state(&self) -> IceConnectionState {
        lock(&self.state).ice_state
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.state).applied_candidates.clone()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.state)
            .local
            .as_ref()
            .map(|s| s.tracks.clone())
            .unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.state)
            .remote
            .as_ref()
            .map(|s| s.tracks.clone())
            .unwrap_or_default()
    }

    pub fn remote_descriptions_applied(&self) -> usize {
        lock(&self.state).remote_descriptions_applied
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.state).offers_created
    }

    pub fn speakerphone(&self) -> bool {
        lock(&self.state).speakerphone
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// Stable numeric session id derived from the device label.
fn session_id(label: &str) -> u64 {
    label
        .bytes()
        .fold(5381u64, |h, b| h.wrapping_mul(33) ^ u64::from(b))
}

/// `(kind, direction)` for each m-line, in order.
fn parse_sections(sdp: &str) -> Vec<(TrackKind, Direction)> {
    let mut sections: Vec<(TrackKind, Direction)> = Vec::new();
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            let kind = match media.split_whitespace().next() {
                Some("audio") => TrackKind::Audio,
                Some("video") => TrackKind::Video,
                _ => continue,
            };
            sections.push((kind, Direction::SendRecv));
        } else if let Some(dir) = line.strip_prefix("a=").and_then(Direction::parse) {
            if let Some(last) = sections.last_mut() {
                last.1 = dir;
            }
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn drain(rx: &mut mpsc::UnboundedReceiver<MediaEvent>) -> Vec<MediaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let (mut alice, alice_ctl) = LoopbackMedia::new("alice");
        let (mut bob, bob_ctl) = LoopbackMedia::new("bob");
        let mut alice_events = alice.take_events().unwrap();
        let mut bob_events = bob.take_events().unwrap();

        alice.acquire_local_media(false).await.unwrap();
        bob.acquire_local_media(false).await.unwrap();

        let offer = alice.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(!offer.sdp.contains("m=video"));

        let answer = bob.create_answer(&offer).await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        alice.set_remote_description(&answer).await.unwrap();

        assert_eq!(alice_ctl.ice_state(), IceConnectionState::Connected);
        assert_eq!(bob_ctl.ice_state(), IceConnectionState::Connected);

        let events = drain(&mut bob_events);
        assert!(events.iter().any(|e| matches!(e, MediaEvent::RemoteTrack(t) if t.kind == TrackKind::Audio)));
        let candidates = drain(&mut alice_events)
            .into_iter()
            .filter(|e| matches!(e, MediaEvent::LocalCandidate(_)))
            .count();
        assert_eq!(candidates, HOST_CANDIDATES as usize);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let (mut media, ctl) = LoopbackMedia::new("carol");
        media.acquire_local_media(false).await.unwrap();
        let candidate = IceCandidate::new(Uuid::now_v7(), Uuid::now_v7(), "candidate:9");

        assert!(media.add_ice_candidate(&candidate).await.is_err());
        media
            .set_remote_description(&SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
            .await
            .unwrap();
        media.add_ice_candidate(&candidate).await.unwrap();
        assert_eq!(ctl.applied_candidates(), vec!["candidate:9".to_string()]);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let (mut media, ctl) = LoopbackMedia::new("dave");
        ctl.deny_permission();
        let err = media.acquire_local_media(true).await.unwrap_err();
        assert!(err.is_acquisition_failure());
    }

    #[test]
    fn test_parse_sections_reads_directions() {
        let sdp = "v=0\r\nm=audio 9 X 111\r\na=mid:0\r\na=sendrecv\r\nm=video 9 X 96\r\na=mid:1\r\na=recvonly\r\n";
        assert_eq!(
            parse_sections(sdp),
            vec![
                (TrackKind::Audio, Direction::SendRecv),
                (TrackKind::Video, Direction::RecvOnly)
            ]
        );
    }
}
