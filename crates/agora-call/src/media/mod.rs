//! Media session binding: the narrow interface to the native peer connection.
//!
//! The real-time media engine (codecs, NAT traversal, DTLS/SRTP) is an
//! external collaborator. The engine only needs the handful of primitives
//! below. Native callbacks (`onIceConnectionStateChange`, `onRemoteTrack`,
//! `onIceCandidate`) are surfaced as a stream of [`MediaEvent`]s so the call
//! state machine consumes them like any other input.

pub mod loopback;

use agora_common::models::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use loopback::{LoopbackControl, LoopbackMedia};

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single local or remote media track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
        }
    }
}

/// A set of tracks (camera + microphone, or what the peer sends us).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Handle to the device's captured media.
pub type LocalStream = MediaStream;
/// Handle to the media received from the peer.
pub type RemoteStream = MediaStream;

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some()
    }
}

/// Connectivity of the underlying transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// Media is flowing.
    pub fn is_up(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// A network candidate discovered by the local media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// Asynchronous notifications from the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    IceConnectionStateChanged(IceConnectionState),
    RemoteTrack(MediaTrack),
    LocalCandidate(LocalCandidate),
}

/// Failures reported by the media engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid media state: {0}")]
    InvalidState(String),

    #[error("Media session closed")]
    Closed,
}

impl MediaError {
    /// Acquisition failures end the attempt before any session exists.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::DeviceUnavailable(_))
    }
}

/// Capability interface over one device's peer connection.
///
/// Owned exclusively by the call engine; every method runs on the call's
/// actor, so implementations need not be `Sync`.
#[async_trait]
pub trait MediaSessionBinding: Send {
    /// Capture microphone (and camera when `video_enabled`).
    async fn acquire_local_media(&mut self, video_enabled: bool) -> Result<LocalStream, MediaError>;

    /// Capture a camera track for an in-call upgrade.
    async fn acquire_video_track(&mut self) -> Result<MediaTrack, MediaError>;

    /// Create and apply a local offer.
    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;

    /// Apply `remote_offer` as remote description, then create and apply a local answer.
    async fn create_answer(
        &mut self,
        remote_offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Add a track to the live session without touching the existing ones.
    async fn add_track(&mut self, track: MediaTrack) -> Result<(), MediaError>;

    /// Enable or disable the local track of `kind`. Returns false when there is none.
    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool;

    fn set_speakerphone(&mut self, enabled: bool);

    fn has_remote_description(&self) -> bool;

    /// Snapshot of the captured media, if acquired.
    fn local_stream(&self) -> Option<LocalStream>;

    /// Snapshot of what the peer sends, once negotiated.
    fn remote_stream(&self) -> Option<RemoteStream>;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Event stream replacing the native callbacks. Can be taken once.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MediaEvent>>;

    /// Stop all tracks and close the connection. Idempotent.
    async fn close(&mut self);
}
