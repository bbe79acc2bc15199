//! Integration tests for the stream client driving a real aggregator
//!
//! Channels are scripted; timers are short real timers.

mod common;

use common::*;
use menusync_client::aggregator::{AggregatorState, ProgressAggregator};
use menusync_client::models::Session;
use menusync_client::resolver::{resolve, SnapshotSource};
use menusync_client::session::SessionWorker;
use menusync_client::stream::{FixedBackend, StreamClient, StreamConfig, StreamOutcome};
use menusync_common::events::{EventBus, StageStatus};
use menusync_common::{Backend, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    client: StreamClient,
    channel: Arc<ScriptedChannel>,
    transport: Arc<FakeTransport>,
}

fn harness(scripts: Vec<Vec<Step>>) -> Harness {
    let channel = Arc::new(ScriptedChannel::new(scripts));
    let transport = Arc::new(FakeTransport::default());
    let client = StreamClient::new(
        channel.clone(),
        transport.clone(),
        Arc::new(FixedBackend(Backend::Ephemeral)),
        StreamConfig::from(&fast_config()),
    );
    Harness {
        client,
        channel,
        transport,
    }
}

fn worker(id: &str) -> (SessionWorker, watch::Receiver<Arc<AggregatorState>>) {
    let aggregator = ProgressAggregator::new(Session::new(id, Backend::Ephemeral));
    SessionWorker::new(aggregator, EventBus::new(64))
}

#[tokio::test]
async fn test_full_run_completes() {
    let h = harness(vec![vec![msg(TRANSLATED), msg(CHUNK_M1), msg(COMPLETED), Step::Hang]]);
    let (worker, state) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Completed { degraded: false }));
    assert_eq!(h.channel.connects(), 1);

    let snapshot = resolve(&state.borrow(), None);
    assert!(snapshot.terminal);
    assert_eq!(snapshot.item_count(), 3);
    assert_eq!(snapshot.overall_percent, 100.0);
}

#[tokio::test]
async fn test_stage_four_idle_timeout_completes_degraded() {
    let h = harness(vec![vec![msg(TRANSLATED), msg(CHUNK_M1), Step::Hang]]);
    let (worker, state) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Completed { degraded: true }));
    assert_eq!(h.channel.connects(), 1, "timeouts do not reconnect");

    let state = state.borrow().clone();
    assert!(state.session.degraded);
    let stage4 = state.stages.get(4).unwrap();
    assert_eq!(stage4.status, StageStatus::Completed);
    assert!(stage4.message.contains("partial results"));

    let snapshot = resolve(&state, None);
    assert_eq!(snapshot.source, SnapshotSource::FinalMenu);
    let mains = snapshot.category("Mains").unwrap();
    assert_eq!(mains.items.len(), 2);
    assert_eq!(
        mains.items[0].item.description.as_deref(),
        Some("Pork broth noodles")
    );
    assert!(snapshot.category("Drinks").is_some());
}

#[tokio::test]
async fn test_early_stage_timeout_is_fatal() {
    let h = harness(vec![vec![
        msg(r#"{"stage":1,"status":"active","message":"reading"}"#),
        Step::Hang,
    ]]);
    let (worker, state) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Failed(Error::Timeout { stage: 1, .. })));
    assert!(state.borrow().session.is_failed());
}

#[tokio::test]
async fn test_ping_is_answered_without_reconnect() {
    let h = harness(vec![vec![
        msg(r#"{"type":"ping"}"#),
        msg(r#"{"type":"heartbeat"}"#),
        msg(r#"{"stage":1,"status":"completed","ocr_text":"ラーメン 800円"}"#),
        msg(COMPLETED),
        Step::Hang,
    ]]);
    let (worker, _) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(outcome.is_success());
    assert_eq!(h.channel.connects(), 1);
    let transport = h.transport.clone();
    assert!(eventually(|| transport.pongs() == 1).await);
}

#[tokio::test]
async fn test_heartbeats_keep_stream_alive() {
    let beat = || vec![Step::Wait(Duration::from_millis(60)), msg(r#"{"type":"heartbeat"}"#)];
    let mut script = vec![msg(r#"{"stage":1,"status":"active"}"#)];
    for _ in 0..5 {
        script.extend(beat());
    }
    script.push(msg(COMPLETED));
    script.push(Step::Hang);

    let h = harness(vec![script]);
    let (worker, _) = worker("s1");
    // 5 x 60ms of silence overall, but never 150ms at once
    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Completed { degraded: false }));
}

#[tokio::test]
async fn test_malformed_messages_are_skipped() {
    let h = harness(vec![vec![
        msg("not json"),
        msg(r#"{"stage":9,"status":"active"}"#),
        msg(r#"[1,2,3]"#),
        msg(COMPLETED),
        Step::Hang,
    ]]);
    let (worker, _) = worker("s1");
    assert!(h.client.open("s1", worker).wait().await.is_success());
}

#[tokio::test]
async fn test_reconnect_after_server_close() {
    let h = harness(vec![
        vec![msg(TRANSLATED)],
        vec![msg(TRANSLATED), msg(COMPLETED), Step::Hang],
    ]);
    let (worker, state) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Completed { degraded: false }));
    assert_eq!(h.channel.connects(), 2);
    // Replayed stage 3 merged without duplicates
    assert_eq!(state.borrow().translated.total_items(), 3);
}

#[tokio::test]
async fn test_reconnect_exhaustion_without_data_is_fatal() {
    let h = harness(vec![]);
    let (worker, state) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    match outcome {
        StreamOutcome::Failed(Error::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("unexpected {:?}", other),
    }
    // Initial connect plus two retries
    assert_eq!(h.channel.connects(), 3);
    assert!(state.borrow().session.is_failed());
}

#[tokio::test]
async fn test_keepalives_do_not_refill_reconnect_budget() {
    // Every connection pings, beats once, then drops
    let flaky = || vec![msg(r#"{"type":"ping"}"#), msg(r#"{"type":"heartbeat"}"#)];
    let h = harness((0..6).map(|_| flaky()).collect());
    let (worker, _) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    match outcome {
        StreamOutcome::Failed(Error::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.channel.connects(), 3);
}

#[tokio::test]
async fn test_stage_event_refills_reconnect_budget() {
    let h = harness(vec![
        vec![msg(r#"{"stage":1,"status":"active"}"#)],
        vec![msg(r#"{"stage":1,"status":"completed"}"#)],
        vec![msg(r#"{"stage":2,"status":"active"}"#)],
        vec![msg(COMPLETED), Step::Hang],
    ]);
    let (worker, _) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Completed { degraded: false }));
    assert_eq!(h.channel.connects(), 4);
}

#[tokio::test]
async fn test_reconnect_exhaustion_with_data_completes_degraded() {
    let h = harness(vec![vec![
        msg(TRANSLATED),
        Step::Fail("connection reset".into()),
    ]]);
    let (worker, state) = worker("s1");

    let outcome = h.client.open("s1", worker).wait().await;
    assert!(matches!(outcome, StreamOutcome::Completed { degraded: true }));
    let snapshot = resolve(&state.borrow(), None);
    assert_eq!(snapshot.item_count(), 3);
    assert!(snapshot.degraded);
}

#[tokio::test]
async fn test_pipeline_error_fails_session() {
    let h = harness(vec![vec![
        msg(r#"{"stage":1,"status":"error","message":"unreadable image"}"#),
        Step::Hang,
    ]]);
    let (worker, _) = worker("s1");
    match h.client.open("s1", worker).wait().await {
        StreamOutcome::Failed(Error::Pipeline { stage, message }) => {
            assert_eq!(stage, 1);
            assert_eq!(message, "unreadable image");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = harness(vec![vec![msg(TRANSLATED), Step::Hang]]);
    let (worker, _) = worker("s1");

    let handle = h.client.open("s1", worker);
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    handle.cancel();
    assert!(handle.is_cancelled());
    assert!(matches!(handle.wait().await, StreamOutcome::Cancelled));
    assert_eq!(h.channel.connects(), 1);
}

#[tokio::test]
async fn test_cancel_during_reconnect_delay() {
    let channel = Arc::new(ScriptedChannel::new(vec![]));
    let mut config = StreamConfig::from(&fast_config());
    config.reconnect_delay = Duration::from_secs(30);
    let client = StreamClient::new(
        channel.clone(),
        Arc::new(FakeTransport::default()),
        Arc::new(FixedBackend(Backend::Ephemeral)),
        config,
    );
    let (worker, _) = worker("s1");

    let handle = client.open("s1", worker);
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("cancel must interrupt the delay");
    assert!(matches!(outcome, StreamOutcome::Cancelled));
    assert_eq!(channel.connects(), 1);
}
