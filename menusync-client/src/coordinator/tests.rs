use super::*;
use crate::aggregator::ProgressAggregator;
use crate::models::Session;
use crate::transport::Artifact;
use async_trait::async_trait;
use menusync_common::events::{decode_message, ChannelMessage};

struct Probes {
    ephemeral_up: bool,
}

#[async_trait]
impl PipelineTransport for Probes {
    async fn start_session(&self, _artifact: &Artifact, _backend: Backend) -> Result<String> {
        Ok("unused".into())
    }

    async fn pong(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn probe(&self, backend: Backend) -> Result<Duration> {
        if backend == Backend::Ephemeral && !self.ephemeral_up {
            return Err(Error::Transport {
                stage: 0,
                message: "connection refused".into(),
            });
        }
        Ok(Duration::from_millis(3))
    }
}

#[derive(Default)]
struct MemoryStore {
    states: Mutex<HashMap<(Backend, String), AggregatorState>>,
    /// Lose the Drinks items on read-back
    lossy: bool,
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_state(&self, backend: Backend, session_id: &str) -> Result<AggregatorState> {
        let mut state = self
            .states
            .lock()
            .unwrap()
            .get(&(backend, session_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(session_id.to_string()))?;
        if self.lossy {
            if let Some(bucket) = state.translated.get_mut("Drinks") {
                bucket.items.clear();
            }
        }
        Ok(state)
    }

    async fn store_state(&self, backend: Backend, session_id: &str, state: &AggregatorState) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert((backend, session_id.to_string()), state.clone());
        Ok(())
    }
}

fn config(rollout: u8) -> CoordinatorConfig {
    CoordinatorConfig {
        primary: Backend::Ephemeral,
        durable_rollout_percent: rollout,
        error_threshold: 3,
        request_timeout: Duration::from_secs(1),
    }
}

fn coordinator(rollout: u8, ephemeral_up: bool, store: MemoryStore) -> (Arc<BackendCoordinator>, EventBus) {
    let bus = EventBus::new(32);
    let health = Arc::new(HealthMonitor::new(
        Arc::new(Probes { ephemeral_up }),
        Duration::from_secs(30),
        Duration::from_millis(200),
    ));
    let coordinator = BackendCoordinator::new(config(rollout), health, Arc::new(store), bus.clone());
    (Arc::new(coordinator), bus)
}

fn live_state(session_id: &str) -> AggregatorState {
    let mut agg = ProgressAggregator::new(Session::new(session_id, Backend::Ephemeral));
    let raw = r#"{"stage":3,"status":"completed","translated_categories":{
        "Mains":[{"id":"m1","source_text":"a"}],
        "Drinks":[{"id":"d1","source_text":"b"}]}}"#;
    let ChannelMessage::Stage(event) = decode_message(raw).unwrap() else {
        panic!("not a stage event")
    };
    agg.apply(&event);
    agg.state().clone()
}

#[test]
fn test_rollout_bucket_is_stable() {
    let a = rollout_bucket("session-abc");
    assert_eq!(a, rollout_bucket("session-abc"));
    assert!(a < 100);

    let (none, _) = coordinator(0, true, MemoryStore::default());
    let (all, _) = coordinator(100, true, MemoryStore::default());
    for i in 0..20 {
        let id = format!("s{}", i);
        assert_eq!(none.backend_for(&id), Backend::Ephemeral);
        assert_eq!(all.backend_for(&id), Backend::Durable);
    }
}

#[test]
fn test_assignment_wins_over_rollout() {
    let (coordinator, _) = coordinator(100, true, MemoryStore::default());
    coordinator.assign("s1", Backend::Ephemeral);
    assert_eq!(coordinator.backend_for("s1"), Backend::Ephemeral);
    coordinator.forget("s1");
    assert_eq!(coordinator.backend_for("s1"), Backend::Durable);
}

#[test]
fn test_stream_errors_pin_to_secondary() {
    let (coordinator, bus) = coordinator(0, true, MemoryStore::default());
    let mut rx = bus.subscribe();
    let router: &dyn BackendRouter = &*coordinator;
    let err = Error::Transport {
        stage: 4,
        message: "reset".into(),
    };

    // Secondary errors are not counted
    for _ in 0..10 {
        router.record_error(Backend::Durable, &err);
    }
    assert!(!coordinator.is_pinned());

    for _ in 0..6 {
        router.record_error(Backend::Ephemeral, &err);
    }
    assert!(coordinator.is_pinned());
    assert_eq!(router.backend_for("anything"), Backend::Durable);
    assert!(matches!(rx.try_recv().unwrap(), SessionUpdate::BackendWarning { .. }));
    assert!(matches!(rx.try_recv().unwrap(), SessionUpdate::BackendPinned { .. }));

    coordinator.clear_rollback();
    assert_eq!(router.backend_for("anything"), Backend::Ephemeral);
}

#[tokio::test]
async fn test_unhealthy_preferred_backend_is_avoided() {
    let (coordinator, _) = coordinator(0, false, MemoryStore::default());
    assert_eq!(coordinator.backend_for("s1"), Backend::Ephemeral);

    assert!(coordinator.health().poll_once(true).await);
    assert_eq!(coordinator.backend_for("s1"), Backend::Durable);
    // Second poll inside the interval is skipped
    assert!(!coordinator.health().poll_once(false).await);
}

#[tokio::test]
async fn test_migration_moves_session() {
    let (coordinator, bus) = coordinator(0, true, MemoryStore::default());
    let mut rx = bus.subscribe();
    let state = live_state("s1");

    let record = coordinator
        .migrate_session("s1", state, Backend::Durable)
        .await
        .unwrap();
    assert!(record.succeeded(), "{:?}", record.outcome);
    assert_eq!(record.from, Backend::Ephemeral);
    assert_eq!(coordinator.backend_for("s1"), Backend::Durable);
    assert!(matches!(
        rx.try_recv().unwrap(),
        SessionUpdate::MigrationSucceeded { to: Backend::Durable, .. }
    ));

    assert_eq!(coordinator.rollback_session("s1"), Some(Backend::Ephemeral));
    assert_eq!(coordinator.backend_for("s1"), Backend::Ephemeral);
    assert_eq!(coordinator.migration_history(Some("s1")).len(), 1);
    assert!(coordinator.migration_history(Some("other")).is_empty());
}

#[tokio::test]
async fn test_failed_validation_keeps_source_backend() {
    let store = MemoryStore {
        lossy: true,
        ..Default::default()
    };
    let (coordinator, bus) = coordinator(0, true, store);
    let mut rx = bus.subscribe();

    let record = coordinator
        .migrate_now("s1", &live_state("s1"), Backend::Durable)
        .await;
    match &record.outcome {
        MigrationOutcome::Failed { reason } => assert!(reason.contains("category count"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(coordinator.backend_for("s1"), Backend::Ephemeral);
    assert!(matches!(rx.try_recv().unwrap(), SessionUpdate::MigrationFailed { .. }));
    assert_eq!(coordinator.rollback_session("s1"), None);
}

#[tokio::test]
async fn test_migration_to_current_backend_is_skipped() {
    let (coordinator, _) = coordinator(0, true, MemoryStore::default());
    let record = coordinator
        .migrate_now("s1", &live_state("s1"), Backend::Ephemeral)
        .await;
    assert!(matches!(record.outcome, MigrationOutcome::Skipped { .. }));
    assert!(coordinator.migration_history(Some("s1")).is_empty());
}

#[tokio::test]
async fn test_history_is_bounded_and_forgotten() {
    let (coordinator, _) = coordinator(0, true, MemoryStore::default());
    let state = live_state("s1");
    let mut target = Backend::Durable;
    for _ in 0..HISTORY_PER_SESSION + 5 {
        let record = coordinator.migrate_now("s1", &state, target).await;
        assert!(record.succeeded(), "{:?}", record.outcome);
        target = target.other();
    }
    coordinator.migrate_now("s2", &live_state("s2"), Backend::Durable).await;

    let history = coordinator.migration_history(Some("s1"));
    assert_eq!(history.len(), HISTORY_PER_SESSION);
    // Oldest dropped first; the last of the alternating moves went to Durable
    assert_eq!(history.last().map(|r| r.to), Some(Backend::Durable));
    assert_eq!(history.first().map(|r| r.to), Some(Backend::Ephemeral));
    assert_eq!(coordinator.migration_history(None).len(), HISTORY_PER_SESSION + 1);

    coordinator.forget("s1");
    assert!(coordinator.migration_history(Some("s1")).is_empty());
    assert_eq!(coordinator.rollback_session("s1"), None);
    assert_eq!(coordinator.migration_history(Some("s2")).len(), 1);
}
