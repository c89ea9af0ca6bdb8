//! Two devices placing calls through one in-process signaling store.

use agora_call::media::{
    IceConnectionState, LoopbackControl, LoopbackMedia, MediaSessionBinding, TrackKind,
};
use agora_call::{CallHandle, CallOutcome, CallPhase, CallSessionController, CallView, EndReason};
use agora_common::config::CallConfig;
use agora_common::models::{CallStatus, CallType, UpgradeStatus};
use agora_signaling::{MemorySignaling, SignalingChannel};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn setup() -> (MemorySignaling, CallSessionController, CallSessionController) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let store = MemorySignaling::new();
    let signaling: Arc<dyn SignalingChannel> = Arc::new(store.clone());
    let alice = CallSessionController::new(Uuid::now_v7(), Arc::clone(&signaling), CallConfig::default());
    let bob = CallSessionController::new(Uuid::now_v7(), signaling, CallConfig::default());
    (store, alice, bob)
}

async fn wait_view(handle: &CallHandle, mut pred: impl FnMut(&CallView) -> bool) -> CallView {
    let mut rx = handle.watch();
    let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|v| pred(v)))
        .await
        .expect("view change within timeout")
        .expect("view channel open");
    view.clone()
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn terminal_writes(store: &MemorySignaling, call_id: Uuid) -> usize {
    store
        .patches(call_id)
        .await
        .iter()
        .filter(|p| p.ended_at.is_some())
        .count()
}

struct Connected {
    caller: CallHandle,
    caller_media: LoopbackControl,
    callee: CallHandle,
    callee_media: LoopbackControl,
}

/// Alice calls Bob and Bob answers.
async fn connect(
    alice: &CallSessionController,
    bob: &CallSessionController,
    call_type: CallType,
) -> Connected {
    let (media, caller_media) = LoopbackMedia::new("alice");
    let caller = alice.place_call(bob.user_id(), call_type, media);
    wait_view(&caller, |v| v.phase == CallPhase::AwaitingAnswer).await;

    let (media, callee_media) = LoopbackMedia::new("bob");
    let callee = bob.answer_call(caller.call_id(), media);

    wait_view(&callee, |v| v.phase == CallPhase::Connected).await;
    wait_view(&caller, |v| v.phase == CallPhase::Connected).await;

    Connected {
        caller,
        caller_media,
        callee,
        callee_media,
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_is_missed_after_ring_timeout() {
    let (store, alice, bob) = setup();
    let (media, control) = LoopbackMedia::new("alice");

    let started = tokio::time::Instant::now();
    let handle = alice.place_call(bob.user_id(), CallType::Voice, media);
    let call_id = handle.call_id();
    let outcome = handle.outcome().await;

    assert!(matches!(
        outcome,
        CallOutcome::Ended {
            reason: EndReason::Missed,
            duration_secs: 0,
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(30));

    let row = store.fetch_call(call_id).await.unwrap();
    assert_eq!(row.status, CallStatus::Missed);
    assert!(row.ended_at.is_some());
    assert_eq!(terminal_writes(&store, call_id).await, 1);
    assert!(control.is_closed());
}

#[tokio::test]
async fn test_declined_call_ends_caller_without_local_terminate() {
    let (store, alice, bob) = setup();
    let (media, control) = LoopbackMedia::new("alice");
    let handle = alice.place_call(bob.user_id(), CallType::Voice, media);
    wait_view(&handle, |v| v.phase == CallPhase::AwaitingAnswer).await;

    bob.decline_incoming(handle.call_id()).await.unwrap();

    let call_id = handle.call_id();
    let view = wait_view(&handle, |v| v.phase.is_ended()).await;
    assert_eq!(view.status_text, "Call declined");
    assert_eq!(handle.outcome().await.reason(), Some(EndReason::Declined));

    // Only Bob's write ended the call.
    assert_eq!(terminal_writes(&store, call_id).await, 1);
    assert_eq!(store.fetch_call(call_id).await.unwrap().status, CallStatus::Declined);
    assert!(control.is_closed());
}

#[tokio::test]
async fn test_decline_after_end_is_rejected() {
    let (_store, alice, bob) = setup();
    let (media, _control) = LoopbackMedia::new("alice");
    let handle = alice.place_call(bob.user_id(), CallType::Voice, media);
    wait_view(&handle, |v| v.phase == CallPhase::AwaitingAnswer).await;

    let call_id = handle.call_id();
    handle.hang_up().await.unwrap();
    assert_eq!(handle.outcome().await.reason(), Some(EndReason::Ended));

    let err = bob.decline_incoming(call_id).await.unwrap_err();
    assert_eq!(err.error_code(), "REMOTE_TERMINATED");
}

#[tokio::test]
async fn test_voice_call_connects_and_exchanges_candidates() {
    let (store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;

    let row = store.fetch_call(call.caller.call_id()).await.unwrap();
    assert_eq!(row.status, CallStatus::Answered);
    assert!(row.started_at.is_some());
    assert!(row.offer.is_some() && row.answer.is_some());

    let view = wait_view(&call.caller, |v| v.remote_audio).await;
    assert_eq!(view.call_type, CallType::Voice);
    assert!(!view.remote_video);

    // Each side applies the other's two host candidates, including the
    // ones that arrived before its remote description.
    eventually(|| call.caller_media.applied_candidates().len() == 2).await;
    eventually(|| call.callee_media.applied_candidates().len() == 2).await;
    let senders: HashSet<Uuid> = store
        .candidates(row.id)
        .await
        .iter()
        .map(|c| c.sender_id)
        .collect();
    assert_eq!(senders, HashSet::from([alice.user_id(), bob.user_id()]));

    call.callee.hang_up().await.unwrap();
    assert_eq!(call.caller.outcome().await.reason(), Some(EndReason::Ended));
    assert_eq!(call.callee.outcome().await.reason(), Some(EndReason::Ended));
    assert_eq!(terminal_writes(&store, row.id).await, 1);
    assert!(call.caller_media.is_closed());
    assert!(call.callee_media.is_closed());
}

#[tokio::test]
async fn test_upgrade_adds_video_and_keeps_audio() {
    let (store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;

    // Camera toggle on a voice call asks for an upgrade.
    call.caller.toggle_camera().await.unwrap();
    let prompt = wait_view(&call.callee, |v| v.upgrade_prompt.is_some()).await;
    assert_eq!(prompt.upgrade_prompt, Some(alice.user_id()));

    call.callee.respond_to_upgrade(true).await.unwrap();

    let caller_view = wait_view(&call.caller, |v| v.call_type == CallType::Video && v.camera_on).await;
    let callee_view = wait_view(&call.callee, |v| v.call_type == CallType::Video && v.remote_video).await;
    assert_eq!(caller_view.phase, CallPhase::Connected);
    assert_eq!(callee_view.phase, CallPhase::Connected);
    assert!(callee_view.upgrade_prompt.is_none());

    let local: Vec<TrackKind> = call.caller_media.local_tracks().iter().map(|t| t.kind).collect();
    assert_eq!(local, vec![TrackKind::Audio, TrackKind::Video]);
    assert!(call.caller_media.local_tracks().iter().all(|t| t.enabled));

    let remote: Vec<TrackKind> = call.callee_media.remote_tracks().iter().map(|t| t.kind).collect();
    assert!(remote.contains(&TrackKind::Audio));
    assert!(remote.contains(&TrackKind::Video));

    // Renegotiated in place: one extra description each way, never closed.
    assert_eq!(call.callee_media.remote_descriptions_applied(), 2);
    wait_view(&call.caller, |v| v.remote_video).await;
    assert_eq!(call.caller_media.remote_descriptions_applied(), 2);
    assert!(!call.caller_media.is_closed());

    let row = store.fetch_call(call.caller.call_id()).await.unwrap();
    assert_eq!(row.call_type, CallType::Video);
    assert_eq!(row.offer_revision, 1);
    assert_eq!(row.answer_revision, 1);
    assert_eq!(row.status, CallStatus::Answered);

    call.caller.hang_up().await.unwrap();
    assert_eq!(call.callee.outcome().await.reason(), Some(EndReason::Ended));
}

#[tokio::test]
async fn test_declined_upgrade_keeps_voice_call() {
    let (store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;

    call.caller.request_upgrade().await.unwrap();
    wait_view(&call.callee, |v| v.upgrade_prompt.is_some()).await;
    let mut caller_events = call.caller.events();
    call.callee.respond_to_upgrade(false).await.unwrap();

    let declined = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match caller_events.recv().await {
                Ok(agora_call::EngineEvent::UpgradeDeclined) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(declined);

    let view = call.caller.view();
    assert_eq!(view.call_type, CallType::Voice);
    assert_eq!(view.phase, CallPhase::Connected);
    let row = store.fetch_call(call.caller.call_id()).await.unwrap();
    assert_eq!(row.offer_revision, 0);

    call.caller.hang_up().await.unwrap();
    call.caller.outcome().await;
}

#[tokio::test]
async fn test_upgrade_without_camera_stays_on_voice_and_can_retry() {
    let (store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;
    let call_id = call.caller.call_id();
    call.caller_media.camera_unavailable();

    call.caller.request_upgrade().await.unwrap();
    wait_view(&call.callee, |v| v.upgrade_prompt.is_some()).await;
    call.callee.respond_to_upgrade(true).await.unwrap();

    let caller_view = wait_view(&call.caller, |v| v.last_error.is_some()).await;
    assert_eq!(caller_view.call_type, CallType::Voice);
    assert_eq!(caller_view.phase, CallPhase::Connected);
    let callee_view = wait_view(&call.callee, |v| v.last_error.is_some()).await;
    assert_eq!(callee_view.call_type, CallType::Voice);

    let row = store.fetch_call(call_id).await.unwrap();
    assert_eq!(row.upgrade_status, UpgradeStatus::None);
    assert_eq!(row.upgrade_seq, 2);
    assert_eq!(row.offer_revision, 0);

    // The callee, camera in hand, can ask again.
    call.callee.request_upgrade().await.unwrap();
    let prompt = wait_view(&call.caller, |v| v.upgrade_prompt.is_some()).await;
    assert_eq!(prompt.upgrade_prompt, Some(bob.user_id()));
    call.caller.respond_to_upgrade(false).await.unwrap();

    call.caller.hang_up().await.unwrap();
    assert_eq!(call.callee.outcome().await.reason(), Some(EndReason::Ended));
    assert!(call.callee_media.is_closed());
}

#[tokio::test]
async fn test_ice_failure_ends_call_once() {
    let (store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;
    let call_id = call.caller.call_id();

    call.caller_media.set_ice_state(IceConnectionState::Failed);
    call.caller_media.set_ice_state(IceConnectionState::Failed);

    assert_eq!(call.caller.outcome().await.reason(), Some(EndReason::Ended));
    assert_eq!(call.callee.outcome().await.reason(), Some(EndReason::Ended));
    assert_eq!(terminal_writes(&store, call_id).await, 1);
    assert_eq!(store.fetch_call(call_id).await.unwrap().status, CallStatus::Ended);
}

#[tokio::test]
async fn test_disconnect_shows_reconnecting_then_recovers() {
    let (_store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;

    call.caller_media.set_ice_state(IceConnectionState::Disconnected);
    let view = wait_view(&call.caller, |v| v.reconnecting).await;
    assert_eq!(view.status_text, "Reconnecting...");
    assert_eq!(view.phase, CallPhase::Connected);

    call.caller_media.set_ice_state(IceConnectionState::Connected);
    let view = wait_view(&call.caller, |v| !v.reconnecting).await;
    assert_eq!(view.status_text, "Connected");

    call.caller.hang_up().await.unwrap();
    call.callee.outcome().await;
}

#[tokio::test(start_paused = true)]
async fn test_duration_counts_while_connected_and_freezes() {
    let (_store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Voice).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    call.caller.hang_up().await.unwrap();

    let watch = call.caller.watch();
    match call.caller.outcome().await {
        CallOutcome::Ended {
            reason,
            duration_secs,
            ..
        } => {
            assert_eq!(reason, EndReason::Ended);
            assert_eq!(duration_secs, 3);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(watch.borrow().duration_secs, 3);
    call.callee.outcome().await;
}

#[tokio::test]
async fn test_toggles_never_touch_the_call_row() {
    let (store, alice, bob) = setup();
    let call = connect(&alice, &bob, CallType::Video).await;
    let call_id = call.caller.call_id();
    let writes = store.patches(call_id).await.len();

    call.caller.toggle_mute().await.unwrap();
    call.caller.toggle_speaker().await.unwrap();
    call.caller.toggle_camera().await.unwrap();
    let view = wait_view(&call.caller, |v| v.muted && !v.camera_on).await;
    assert!(!view.speaker_on);

    let tracks = call.caller_media.local_tracks();
    assert!(tracks.iter().all(|t| !t.enabled));
    assert!(!call.caller_media.speakerphone());
    assert_eq!(store.patches(call_id).await.len(), writes);

    call.caller.hang_up().await.unwrap();
    call.callee.outcome().await;
}

#[tokio::test]
async fn test_permission_denied_creates_no_call() {
    let (store, alice, bob) = setup();
    let (media, control) = LoopbackMedia::new("alice");
    control.deny_permission();

    let handle = alice.place_call(bob.user_id(), CallType::Video, media);
    let outcome = handle.outcome().await;

    assert!(matches!(outcome, CallOutcome::PermissionDenied { .. }));
    assert_eq!(store.stats().await.total_calls, 0);
}

#[tokio::test]
async fn test_closed_media_is_a_setup_failure_not_a_denial() {
    let (store, alice, bob) = setup();
    let (mut media, control) = LoopbackMedia::new("alice");
    media.close().await;

    let handle = alice.place_call(bob.user_id(), CallType::Voice, media);
    match handle.outcome().await {
        CallOutcome::Ended { reason, error, .. } => {
            assert_eq!(reason, EndReason::Ended);
            assert!(error.is_some_and(|e| e.contains("closed")));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(control.is_closed());
    assert_eq!(store.stats().await.total_calls, 0);
}

#[tokio::test]
async fn test_callee_permission_denied_leaves_row_ringing() {
    let (store, alice, bob) = setup();
    let (media, _caller_media) = LoopbackMedia::new("alice");
    let caller = alice.place_call(bob.user_id(), CallType::Voice, media);
    wait_view(&caller, |v| v.phase == CallPhase::AwaitingAnswer).await;
    let writes = store.patches(caller.call_id()).await.len();

    let (media, control) = LoopbackMedia::new("bob");
    control.deny_permission();
    let callee = bob.answer_call(caller.call_id(), media);
    assert!(matches!(
        callee.outcome().await,
        CallOutcome::PermissionDenied { .. }
    ));

    let row = store.fetch_call(caller.call_id()).await.unwrap();
    assert_eq!(row.status, CallStatus::Ringing);
    assert_eq!(store.patches(caller.call_id()).await.len(), writes);

    caller.hang_up().await.unwrap();
    caller.outcome().await;
}

#[tokio::test]
async fn test_duplicate_delivery_is_harmless() {
    let (store, alice, bob) = setup();
    store.set_duplicate_delivery(true).await;
    let call = connect(&alice, &bob, CallType::Voice).await;
    let call_id = call.caller.call_id();

    wait_view(&call.caller, |v| v.remote_audio).await;
    call.callee.hang_up().await.unwrap();

    assert_eq!(call.caller.outcome().await.reason(), Some(EndReason::Ended));
    assert_eq!(call.callee.outcome().await.reason(), Some(EndReason::Ended));
    assert_eq!(terminal_writes(&store, call_id).await, 1);

    let applied = call.caller_media.applied_candidates();
    let unique: HashSet<&String> = applied.iter().collect();
    assert_eq!(unique.len(), applied.len());

    let offers = store
        .patches(call_id)
        .await
        .iter()
        .filter(|p| p.offer.is_some())
        .count();
    assert_eq!(offers, 1);
}

#[tokio::test]
async fn test_setup_write_failure_is_reported() {
    let (store, alice, bob) = setup();
    store.fail_next_writes(1).await;
    let (media, control) = LoopbackMedia::new("alice");

    let handle = alice.place_call(bob.user_id(), CallType::Voice, media);
    match handle.outcome().await {
        CallOutcome::Ended { reason, error, .. } => {
            assert_eq!(reason, EndReason::Ended);
            assert!(error.is_some());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(control.is_closed());
    assert_eq!(store.stats().await.total_calls, 0);
}
