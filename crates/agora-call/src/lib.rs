//! # agora-call
//!
//! Peer-to-peer voice/video calls between two users.
//!
//! - [`media`]: the narrow interface to the native peer connection, plus a
//!   loopback implementation for tests and the demo
//! - [`engine`]: the per-call state machine (offer/answer/ICE exchange,
//!   voice → video upgrade, termination)
//! - [`controller`]: one actor task per call driving the engine from user
//!   commands, signaling deliveries, media events and timers
//!
//! The two devices never talk directly. They share one Call row and one
//! candidate log through a [`agora_signaling::SignalingChannel`].

pub mod controller;
pub mod engine;
pub mod error;
pub mod media;
pub mod state;

pub use controller::{CallCommand, CallHandle, CallOutcome, CallSessionController, CallView};
pub use engine::CallSignalingEngine;
pub use error::{CallError, CallResult};
pub use media::{MediaError, MediaSessionBinding};
pub use state::{CallPhase, CallRole, EndReason, EngineEvent, UpgradePhase};
