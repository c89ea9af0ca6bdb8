//! Call session controller: runs one call per actor task.
//!
//! Architecture:
//! ```text
//!   CallHandle ──commands──▶ ┌────────────┐ ◀── Subscription (row + candidates)
//!                            │ call actor │ ◀── MediaEvent stream
//!   CallView   ◀──watch───── │  (engine)  │ ◀── ring timeout / duration tick
//!   EngineEvent ◀─broadcast─ └────────────┘
//! ```
//!
//! Every input is turned into one step and applied to the engine before the
//! next is read, so transitions never interleave. The actor owns the ring
//! timeout and the duration timer; both are dropped with the loop, so no
//! late tick can touch a finished call.

use crate::engine::CallSignalingEngine;
use crate::error::{CallError, CallResult};
use crate::media::{IceConnectionState, MediaError, MediaEvent, MediaSessionBinding, TrackKind};
use crate::state::{CallPhase, CallRole, EndReason, EngineEvent, UpgradePhase};
use agora_common::config::CallConfig;
use agora_common::models::{Call, CallPatch, CallStatus, CallType};
use agora_common::SignalingError;
use agora_signaling::{SignalingChannel, SignalingEvent, Subscription};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval};
use uuid::Uuid;

/// User intents sent to a running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    ToggleMute,
    /// On a voice call this asks the peer for a video upgrade instead.
    ToggleCamera,
    ToggleSpeaker,
    RequestUpgrade,
    RespondToUpgrade { accept: bool },
    HangUp,
}

/// Everything a call screen renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallView {
    pub call_id: Uuid,
    pub status_text: String,
    pub phase: CallPhase,
    pub call_type: CallType,
    pub muted: bool,
    pub camera_on: bool,
    pub speaker_on: bool,
    pub duration_secs: u64,
    pub ice_state: IceConnectionState,
    /// The peer's pending upgrade request.
    pub upgrade_prompt: Option<Uuid>,
    pub reconnecting: bool,
    pub remote_audio: bool,
    pub remote_video: bool,
    pub last_error: Option<String>,
}

impl CallView {
    fn new(call_id: Uuid, call_type: CallType, status_text: &str) -> Self {
        Self {
            call_id,
            status_text: status_text.to_string(),
            phase: CallPhase::Idle,
            call_type,
            muted: false,
            camera_on: call_type.has_video(),
            speaker_on: call_type.has_video(),
            duration_secs: 0,
            ice_state: IceConnectionState::New,
            upgrade_prompt: None,
            reconnecting: false,
            remote_audio: false,
            remote_video: false,
            last_error: None,
        }
    }
}

/// How a call attempt finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    /// Local media was refused. No call record was touched.
    PermissionDenied { message: String },
    Ended {
        reason: EndReason,
        duration_secs: u64,
        /// The last failure seen during the call, if any.
        error: Option<String>,
    },
}

impl CallOutcome {
    pub fn reason(&self) -> Option<EndReason> {
        match self {
            Self::Ended { reason, .. } => Some(*reason),
            Self::PermissionDenied { .. } => None,
        }
    }
}

/// Handle to a running call.
pub struct CallHandle {
    call_id: Uuid,
    commands: mpsc::Sender<CallCommand>,
    view: watch::Receiver<CallView>,
    events: broadcast::Sender<EngineEvent>,
    task: JoinHandle<CallOutcome>,
}

impl CallHandle {
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Current view snapshot.
    pub fn view(&self) -> CallView {
        self.view.borrow().clone()
    }

    /// A receiver notified on every view change.
    pub fn watch(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: CallCommand) -> CallResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::SessionClosed)
    }

    pub async fn toggle_mute(&self) -> CallResult<()> {
        self.send(CallCommand::ToggleMute).await
    }

    pub async fn toggle_camera(&self) -> CallResult<()> {
        self.send(CallCommand::ToggleCamera).await
    }

    pub async fn toggle_speaker(&self) -> CallResult<()> {
        self.send(CallCommand::ToggleSpeaker).await
    }

    pub async fn request_upgrade(&self) -> CallResult<()> {
        self.send(CallCommand::RequestUpgrade).await
    }

    pub async fn respond_to_upgrade(&self, accept: bool) -> CallResult<()> {
        self.send(CallCommand::RespondToUpgrade { accept }).await
    }

    pub async fn hang_up(&self) -> CallResult<()> {
        self.send(CallCommand::HangUp).await
    }

    /// Wait for the call to finish.
    pub async fn outcome(self) -> CallOutcome {
        let duration_secs = self.view.borrow().duration_secs;
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => CallOutcome::Ended {
                reason: EndReason::Ended,
                duration_secs,
                error: Some(format!("call task failed: {e}")),
            },
        }
    }
}

/// Places and answers calls for one user.
#[derive(Clone)]
pub struct CallSessionController {
    user_id: Uuid,
    signaling: Arc<dyn SignalingChannel>,
    config: CallConfig,
}

impl CallSessionController {
    pub fn new(user_id: Uuid, signaling: Arc<dyn SignalingChannel>, config: CallConfig) -> Self {
        Self {
            user_id,
            signaling,
            config,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Call `callee_id`. The row is created only once local media is acquired.
    pub fn place_call<M>(&self, callee_id: Uuid, call_type: CallType, media: M) -> CallHandle
    where
        M: MediaSessionBinding + 'static,
    {
        let call = Call::new(self.user_id, callee_id, call_type);
        let call_id = call.id;
        let (channels, handle) = self.channels(call_id, call_type, "Calling...");

        let signaling = Arc::clone(&self.signaling);
        let config = self.config.clone();
        let task = tokio::spawn(run_caller(signaling, config, call, media, channels));

        handle(task)
    }

    /// Enter the call screen for an incoming call and answer it.
    pub fn answer_call<M>(&self, call_id: Uuid, media: M) -> CallHandle
    where
        M: MediaSessionBinding + 'static,
    {
        let (channels, handle) = self.channels(call_id, CallType::Voice, "Connecting...");

        let signaling = Arc::clone(&self.signaling);
        let config = self.config.clone();
        let user_id = self.user_id;
        let task = tokio::spawn(run_callee(signaling, config, user_id, call_id, media, channels));

        handle(task)
    }

    /// Decline an incoming call without entering the call screen.
    pub async fn decline_incoming(&self, call_id: Uuid) -> CallResult<()> {
        decline_incoming(self.signaling.as_ref(), self.user_id, call_id).await
    }

    fn channels(
        &self,
        call_id: Uuid,
        call_type: CallType,
        status_text: &str,
    ) -> (ActorChannels, impl FnOnce(JoinHandle<CallOutcome>) -> CallHandle) {
        let buffer = self.config.event_buffer.max(1);
        let (commands_tx, commands_rx) = mpsc::channel(buffer);
        let (view_tx, view_rx) = watch::channel(CallView::new(call_id, call_type, status_text));
        let (events_tx, _) = broadcast::channel(buffer);

        let channels = ActorChannels {
            commands: commands_rx,
            view: view_tx,
            events: events_tx.clone(),
        };
        let handle = move |task: JoinHandle<CallOutcome>| CallHandle {
            call_id,
            commands: commands_tx,
            view: view_rx,
            events: events_tx,
            task,
        };
        (channels, handle)
    }
}

/// Write `declined` for a ringing call. Fails if the call already ended.
pub async fn decline_incoming(
    signaling: &dyn SignalingChannel,
    user_id: Uuid,
    call_id: Uuid,
) -> CallResult<()> {
    let call = signaling.fetch_call(call_id).await?;
    if call.callee_id != user_id {
        return Err(CallError::NotParticipant {
            call: call_id,
            user: user_id,
        });
    }

    let patch = CallPatch::terminate(CallStatus::Declined, chrono::Utc::now());
    match signaling.update_call(call_id, patch).await {
        Ok(_) => {
            tracing::info!(call = %call_id, user = %user_id, "Incoming call declined");
            Ok(())
        }
        Err(SignalingError::ConditionFailed { current }) => {
            let reason = EndReason::from_status(current.status).unwrap_or(EndReason::Ended);
            Err(CallError::RemoteTerminated(reason))
        }
        Err(e) => Err(e.into()),
    }
}

struct ActorChannels {
    commands: mpsc::Receiver<CallCommand>,
    view: watch::Sender<CallView>,
    events: broadcast::Sender<EngineEvent>,
}

/// Caller side: acquire media, create the row, send the offer.
async fn run_caller<M: MediaSessionBinding>(
    signaling: Arc<dyn SignalingChannel>,
    config: CallConfig,
    call: Call,
    mut media: M,
    channels: ActorChannels,
) -> CallOutcome {
    if let Err(e) = media.acquire_local_media(call.call_type.has_video()).await {
        return media_unavailable(&channels.view, &mut media, e).await;
    }

    let call = match signaling.create_call(call).await {
        Ok(call) => call,
        Err(e) => return setup_failed(&channels.view, &mut media, e.into()).await,
    };
    tracing::info!(call = %call.id, caller = %call.caller_id, callee = %call.callee_id, "Placing call");

    let media_events = media.take_events();
    let engine = match CallSignalingEngine::new(&call, call.caller_id, media, Arc::clone(&signaling))
    {
        Ok(engine) => engine,
        Err(e) => return failed_outcome(&channels.view, e),
    };
    let mut actor = CallActor::new(engine, channels);

    let subscription = match signaling.subscribe(call.id).await {
        Ok(sub) => sub.with_resync(Arc::clone(&signaling)),
        Err(e) => return actor.abort(e.into()).await,
    };

    let ring_deadline = Some(Instant::now() + config.ring_timeout());
    let result = actor.engine.start_as_caller().await;
    actor.establish(result).await;

    actor
        .run(subscription, media_events, ring_deadline, &config)
        .await
}

/// Callee side: fetch the row, acquire media, answer once the offer is there.
async fn run_callee<M: MediaSessionBinding>(
    signaling: Arc<dyn SignalingChannel>,
    config: CallConfig,
    user_id: Uuid,
    call_id: Uuid,
    mut media: M,
    channels: ActorChannels,
) -> CallOutcome {
    let call = match signaling.fetch_call(call_id).await {
        Ok(call) => call,
        Err(e) => return failed_outcome(&channels.view, e.into()),
    };
    if let Some(reason) = EndReason::from_status(call.status) {
        tracing::info!(call = %call_id, reason = %reason, "Call already over");
        channels.view.send_modify(|view| {
            view.phase = CallPhase::Ended(reason);
            view.status_text = status_text(CallPhase::Ended(reason), false).to_string();
        });
        return CallOutcome::Ended {
            reason,
            duration_secs: 0,
            error: None,
        };
    }

    if let Err(e) = media.acquire_local_media(call.call_type.has_video()).await {
        return media_unavailable(&channels.view, &mut media, e).await;
    }

    let media_events = media.take_events();
    let engine = match CallSignalingEngine::new(&call, user_id, media, Arc::clone(&signaling)) {
        Ok(engine) => engine,
        Err(e) => return failed_outcome(&channels.view, e),
    };
    let mut actor = CallActor::new(engine, channels);

    let subscription = match signaling.subscribe(call_id).await {
        Ok(sub) => sub.with_resync(Arc::clone(&signaling)),
        Err(e) => return actor.abort(e.into()).await,
    };

    actor.run(subscription, media_events, None, &config).await
}

async fn media_unavailable<M: MediaSessionBinding>(
    view: &watch::Sender<CallView>,
    media: &mut M,
    err: MediaError,
) -> CallOutcome {
    if err.is_acquisition_failure() {
        permission_denied(view, media, err).await
    } else {
        setup_failed(view, media, CallError::Media(err)).await
    }
}

async fn permission_denied<M: MediaSessionBinding>(
    view: &watch::Sender<CallView>,
    media: &mut M,
    err: MediaError,
) -> CallOutcome {
    tracing::warn!(error = %err, "Local media unavailable");
    media.close().await;
    let message = err.to_string();
    view.send_modify(|v| {
        v.status_text = "Microphone or camera permission denied".into();
        v.last_error = Some(message.clone());
    });
    CallOutcome::PermissionDenied { message }
}

async fn setup_failed<M: MediaSessionBinding>(
    view: &watch::Sender<CallView>,
    media: &mut M,
    err: CallError,
) -> CallOutcome {
    media.close().await;
    failed_outcome(view, err)
}

fn failed_outcome(view: &watch::Sender<CallView>, err: CallError) -> CallOutcome {
    tracing::warn!(error = %err, "Call setup failed");
    let error = err.to_string();
    view.send_modify(|v| {
        v.phase = CallPhase::Ended(EndReason::Ended);
        v.status_text = status_text(v.phase, false).to_string();
        v.last_error = Some(error.clone());
    });
    CallOutcome::Ended {
        reason: EndReason::Ended,
        duration_secs: 0,
        error: Some(error),
    }
}

/// One loop iteration's input.
enum Step {
    Command(CallCommand),
    HandleDropped,
    Signal(SignalingEvent),
    FeedClosed,
    Media(MediaEvent),
    MediaClosed,
    RingTimeout,
    Tick,
}

struct CallActor<M: MediaSessionBinding> {
    engine: CallSignalingEngine<M>,
    commands: Option<mpsc::Receiver<CallCommand>>,
    view: watch::Sender<CallView>,
    events: broadcast::Sender<EngineEvent>,

    muted: bool,
    camera_on: bool,
    speaker_on: bool,
    duration_secs: u64,
    ice_state: IceConnectionState,
    upgrade_prompt: Option<Uuid>,
    reconnecting: bool,
    remote_audio: bool,
    remote_video: bool,
    last_error: Option<String>,
}

impl<M: MediaSessionBinding> CallActor<M> {
    fn new(engine: CallSignalingEngine<M>, channels: ActorChannels) -> Self {
        let video = engine.call_type().has_video();
        let mut actor = Self {
            engine,
            commands: Some(channels.commands),
            view: channels.view,
            events: channels.events,
            muted: false,
            camera_on: video,
            speaker_on: video,
            duration_secs: 0,
            ice_state: IceConnectionState::New,
            upgrade_prompt: None,
            reconnecting: false,
            remote_audio: false,
            remote_video: false,
            last_error: None,
        };
        actor.engine.media_mut().set_speakerphone(video);
        actor
    }

    /// The event loop. Returns once the engine reaches `Ended`.
    async fn run(
        mut self,
        mut subscription: Subscription,
        mut media_events: Option<mpsc::UnboundedReceiver<MediaEvent>>,
        mut ring_deadline: Option<Instant>,
        config: &CallConfig,
    ) -> CallOutcome {
        let mut duration_timer: Option<Interval> = None;
        self.publish();

        loop {
            match self.engine.phase() {
                CallPhase::Connected => {
                    ring_deadline = None;
                    if duration_timer.is_none() {
                        let tick = config.duration_tick();
                        duration_timer = Some(interval_at(Instant::now() + tick, tick));
                    }
                }
                CallPhase::Ended(_) => break,
                _ => {}
            }

            let step = tokio::select! {
                cmd = recv_command(&mut self.commands) => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::HandleDropped,
                },
                event = subscription.recv() => match event {
                    Some(event) => Step::Signal(event),
                    None => Step::FeedClosed,
                },
                event = recv_media(&mut media_events) => match event {
                    Some(event) => Step::Media(event),
                    None => Step::MediaClosed,
                },
                _ = sleep_opt(ring_deadline) => Step::RingTimeout,
                _ = tick_opt(&mut duration_timer) => Step::Tick,
            };

            match step {
                Step::Command(cmd) => self.on_command(cmd).await,
                Step::HandleDropped => {
                    tracing::debug!(call = %self.engine.call_id(), "Call handle dropped, hanging up");
                    self.commands = None;
                    let result = self.engine.terminate(EndReason::Ended).await;
                    self.record(result);
                }
                Step::Signal(SignalingEvent::CallUpdated(call)) => {
                    let result = self.engine.on_remote_call_update(&call).await;
                    self.record(result);
                    self.maybe_answer(&call).await;
                }
                Step::Signal(SignalingEvent::CandidateInserted(candidate)) => {
                    let result = self.engine.on_remote_ice_candidate(candidate).await;
                    self.record(result);
                }
                Step::FeedClosed => {
                    tracing::warn!(call = %self.engine.call_id(), "Signaling feed closed");
                    self.last_error = Some(SignalingError::Closed.to_string());
                    let result = self.engine.terminate(EndReason::Ended).await;
                    self.record(result);
                }
                Step::Media(event) => {
                    let result = self.engine.on_media_event(event).await;
                    self.record(result);
                }
                Step::MediaClosed => media_events = None,
                Step::RingTimeout => {
                    ring_deadline = None;
                    tracing::info!(call = %self.engine.call_id(), "No answer, call missed");
                    let result = self.engine.terminate(EndReason::Missed).await;
                    self.record(result);
                }
                Step::Tick => self.duration_secs += 1,
            }

            self.forward_events();
            self.publish();
        }

        // Timers die with the loop; the duration is frozen here.
        drop(duration_timer);
        let reason = self.engine.phase().end_reason().unwrap_or(EndReason::Ended);
        self.publish();
        CallOutcome::Ended {
            reason,
            duration_secs: self.duration_secs,
            error: self.last_error,
        }
    }

    async fn on_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::ToggleMute => {
                self.muted = !self.muted;
                let muted = self.muted;
                self.engine.media_mut().set_track_enabled(TrackKind::Audio, !muted);
            }
            CallCommand::ToggleCamera if self.engine.call_type() == CallType::Voice => {
                let result = self.engine.request_upgrade().await;
                self.record(result);
            }
            CallCommand::ToggleCamera => {
                self.camera_on = !self.camera_on;
                let camera_on = self.camera_on;
                self.engine
                    .media_mut()
                    .set_track_enabled(TrackKind::Video, camera_on);
            }
            CallCommand::ToggleSpeaker => {
                self.speaker_on = !self.speaker_on;
                let speaker_on = self.speaker_on;
                self.engine.media_mut().set_speakerphone(speaker_on);
            }
            CallCommand::RequestUpgrade => {
                let result = self.engine.request_upgrade().await;
                self.record(result);
            }
            CallCommand::RespondToUpgrade { accept } => {
                let result = self.engine.respond_to_upgrade(accept).await;
                if result.is_ok() {
                    self.upgrade_prompt = None;
                }
                self.record(result);
            }
            CallCommand::HangUp => {
                let result = self.engine.terminate(EndReason::Ended).await;
                self.record(result);
            }
        }
    }

    /// Callee: answer as soon as the caller's offer is on a ringing row.
    async fn maybe_answer(&mut self, call: &Call) {
        if self.engine.role() != CallRole::Callee
            || self.engine.phase() != CallPhase::Idle
            || call.status != CallStatus::Ringing
            || call.offer_revision != 0
        {
            return;
        }
        let Some(offer) = call.offer.as_ref() else {
            return;
        };
        let result = self.engine.accept_as_callee(offer).await;
        self.establish(result).await;
    }

    /// Offer or answer could not be written: the call cannot proceed.
    async fn establish(&mut self, result: CallResult<()>) {
        let failed_write = matches!(result, Err(CallError::SignalingWrite(_)));
        self.record(result);
        if failed_write {
            let result = self.engine.terminate(EndReason::Ended).await;
            self.record(result);
        }
        self.forward_events();
        self.publish();
    }

    async fn abort(mut self, err: CallError) -> CallOutcome {
        self.record(Err(err));
        let result = self.engine.terminate(EndReason::Ended).await;
        self.record(result);
        self.forward_events();
        self.publish();
        CallOutcome::Ended {
            reason: self.engine.phase().end_reason().unwrap_or(EndReason::Ended),
            duration_secs: 0,
            error: self.last_error,
        }
    }

    fn record(&mut self, result: CallResult<()>) {
        if let Err(e) = result {
            tracing::warn!(call = %self.engine.call_id(), code = e.error_code(), error = %e, "Call operation failed");
            self.last_error = Some(e.to_string());
        }
    }

    /// Fold engine events into the view and fan them out.
    fn forward_events(&mut self) {
        for event in self.engine.drain_events() {
            match &event {
                EngineEvent::UpgradePrompt { requester } => self.upgrade_prompt = Some(*requester),
                EngineEvent::Upgraded => {
                    self.upgrade_prompt = None;
                    self.camera_on = self
                        .engine
                        .media()
                        .local_stream()
                        .is_some_and(|s| s.has(TrackKind::Video));
                    if !self.speaker_on {
                        self.speaker_on = true;
                        self.engine.media_mut().set_speakerphone(true);
                    }
                }
                EngineEvent::RemoteTrack(track) => match track.kind {
                    TrackKind::Audio => self.remote_audio = true,
                    TrackKind::Video => self.remote_video = true,
                },
                EngineEvent::IceStateChanged(state) => self.ice_state = *state,
                EngineEvent::ConnectionDegraded => self.reconnecting = true,
                EngineEvent::ConnectionRestored => self.reconnecting = false,
                EngineEvent::UpgradeFailed(msg) => self.last_error = Some(msg.clone()),
                EngineEvent::PhaseChanged(_) | EngineEvent::UpgradeDeclined => {}
            }
            if self.engine.upgrade() != UpgradePhase::Requested {
                self.upgrade_prompt = None;
            }
            let _ = self.events.send(event);
        }
    }

    fn publish(&self) {
        let phase = self.engine.phase();
        self.view.send_replace(CallView {
            call_id: self.engine.call_id(),
            status_text: status_text(phase, self.reconnecting).to_string(),
            phase,
            call_type: self.engine.call_type(),
            muted: self.muted,
            camera_on: self.camera_on,
            speaker_on: self.speaker_on,
            duration_secs: self.duration_secs,
            ice_state: self.ice_state,
            upgrade_prompt: self.upgrade_prompt,
            reconnecting: self.reconnecting,
            remote_audio: self.remote_audio,
            remote_video: self.remote_video,
            last_error: self.last_error.clone(),
        });
    }
}

fn status_text(phase: CallPhase, reconnecting: bool) -> &'static str {
    match phase {
        CallPhase::Idle | CallPhase::AnsweringOffer => "Connecting...",
        CallPhase::Initiating => "Calling...",
        CallPhase::AwaitingAnswer => "Ringing...",
        CallPhase::Connected if reconnecting => "Reconnecting...",
        CallPhase::Connected => "Connected",
        CallPhase::Ended(EndReason::Ended) => "Call ended",
        CallPhase::Ended(EndReason::Declined) => "Call declined",
        CallPhase::Ended(EndReason::Missed) => "No answer",
    }
}

async fn recv_command(commands: &mut Option<mpsc::Receiver<CallCommand>>) -> Option<CallCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_media(events: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>) -> Option<MediaEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
