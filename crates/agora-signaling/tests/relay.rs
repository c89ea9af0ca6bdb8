//! End-to-end tests of the relay and its client over a real socket.

use agora_common::config::SignalingConfig;
use agora_common::models::{Call, CallPatch, CallStatus, CallType, IceCandidate, SessionDescription};
use agora_common::SignalingError;
use agora_signaling::relay::{build_router, RelayState};
use agora_signaling::{MemorySignaling, RelaySignaling, SignalingChannel, SignalingEvent};
use std::time::Duration;
use uuid::Uuid;

async fn start_relay() -> (MemorySignaling, SignalingConfig) {
    let store = MemorySignaling::new();
    let router = build_router(RelayState::new(store.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let config = SignalingConfig {
        url: format!("ws://{addr}/signaling"),
        request_timeout_ms: 5_000,
        ..Default::default()
    };
    (store, config)
}

async fn next_event(feed: &mut agora_signaling::Subscription) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), feed.recv())
        .await
        .expect("event within timeout")
        .expect("feed open")
}

#[tokio::test]
async fn test_two_devices_share_one_call_row() {
    let (store, config) = start_relay().await;
    let caller = RelaySignaling::connect(&config).await.unwrap();
    let callee = RelaySignaling::connect(&config).await.unwrap();

    let call = Call::new(Uuid::now_v7(), Uuid::now_v7(), CallType::Voice);
    caller.create_call(call.clone()).await.unwrap();

    let mut feed = callee.subscribe(call.id).await.unwrap();
    match next_event(&mut feed).await {
        SignalingEvent::CallUpdated(row) => assert_eq!(row.id, call.id),
        other => panic!("unexpected event: {other:?}"),
    }

    let updated = caller
        .update_call(call.id, CallPatch::offer(SessionDescription::offer("v=0"), 0))
        .await
        .unwrap();
    assert!(updated.offer.is_some());

    match next_event(&mut feed).await {
        SignalingEvent::CallUpdated(row) => assert_eq!(row.offer, updated.offer),
        other => panic!("unexpected event: {other:?}"),
    }

    let candidate = IceCandidate::new(call.id, call.caller_id, "candidate:1 1 udp 1 10.0.0.1 5000 typ host");
    caller.insert_candidate(candidate.clone()).await.unwrap();
    assert_eq!(
        next_event(&mut feed).await,
        SignalingEvent::CandidateInserted(candidate)
    );

    assert_eq!(store.candidates(call.id).await.len(), 1);
}

#[tokio::test]
async fn test_condition_failure_crosses_the_wire() {
    let (_store, config) = start_relay().await;
    let device = RelaySignaling::connect(&config).await.unwrap();

    let call = Call::new(Uuid::now_v7(), Uuid::now_v7(), CallType::Video);
    device.create_call(call.clone()).await.unwrap();
    device
        .update_call(call.id, CallPatch::terminate(CallStatus::Declined, chrono::Utc::now()))
        .await
        .unwrap();

    let err = device
        .update_call(call.id, CallPatch::terminate(CallStatus::Ended, chrono::Utc::now()))
        .await
        .unwrap_err();
    match err {
        SignalingError::ConditionFailed { current } => {
            assert_eq!(current.status, CallStatus::Declined);
            assert!(current.ended_at.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_call_is_not_found() {
    let (_store, config) = start_relay().await;
    let device = RelaySignaling::connect(&config).await.unwrap();

    let err = device.fetch_call(Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(err, SignalingError::NotFound { .. }));
    assert!(device.subscribe(Uuid::now_v7()).await.is_err());
}
