//! Session lifecycle
//!
//! **Per session id:**
//! - at most one live stream; attaching again closes (and awaits) the old one
//!   first, then continues from its state unless that state was terminal.
//!   Attach and reset for the same id run one at a time
//! - the latest aggregator state is published through a `watch` channel
//! - after the stream ends, the session stays queryable for the completion
//!   grace period and is then evicted
//!
//! `reset` drops a session immediately, including its backend assignment.

use super::worker::SessionWorker;
use crate::aggregator::{AggregatorState, ProgressAggregator};
use crate::coordinator::{BackendCoordinator, MigrationRecord};
use crate::images::{ImageMatcher, ImageUrlCache};
use crate::models::Session;
use crate::resolver::{self, MenuSnapshot};
use crate::stream::{BackendRouter, StreamClient, StreamConfig, StreamHandle, StreamOutcome};
use crate::transport::{Artifact, EventChannel, PipelineTransport, SessionStore};
use menusync_common::config::ClientConfig;
use menusync_common::events::EventBus;
use menusync_common::{Backend, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a session's stream ended (cloneable for any number of waiters)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed { degraded: bool },
    Cancelled,
    Failed { error: String },
}

impl From<StreamOutcome> for SessionOutcome {
    fn from(outcome: StreamOutcome) -> Self {
        match outcome {
            StreamOutcome::Completed { degraded } => SessionOutcome::Completed { degraded },
            StreamOutcome::Cancelled => SessionOutcome::Cancelled,
            StreamOutcome::Failed(e) => SessionOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

/// Caller's view of one attached session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    backend: Backend,
    state_rx: watch::Receiver<Arc<AggregatorState>>,
    outcome_rx: watch::Receiver<Option<SessionOutcome>>,
    cache: Arc<ImageUrlCache>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Backend the session was attached on
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn state(&self) -> Arc<AggregatorState> {
        self.state_rx.borrow().clone()
    }

    /// Receiver that wakes on every published state
    pub fn watch_state(&self) -> watch::Receiver<Arc<AggregatorState>> {
        self.state_rx.clone()
    }

    pub fn snapshot(&self) -> MenuSnapshot {
        resolver::resolve(&self.state(), Some(&self.cache))
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome_rx.borrow().clone()
    }

    /// Wait for the stream to end
    pub async fn wait(&mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = self.outcome_rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.outcome_rx.changed().await.is_err() {
                return self
                    .outcome_rx
                    .borrow()
                    .clone()
                    .unwrap_or(SessionOutcome::Cancelled);
            }
        }
    }
}

struct ActiveSession {
    generation: u64,
    token: CancellationToken,
    supervisor: JoinHandle<()>,
    state_rx: watch::Receiver<Arc<AggregatorState>>,
    outcome_rx: watch::Receiver<Option<SessionOutcome>>,
}

impl ActiveSession {
    /// Stop the stream (and any pending eviction) and wait for it
    async fn shutdown(self) -> Arc<AggregatorState> {
        self.token.cancel();
        if let Err(e) = self.supervisor.await {
            warn!(error = %e, "Session supervisor ended abnormally");
        }
        let state = self.state_rx.borrow().clone();
        state
    }
}

type SessionTable = Arc<Mutex<HashMap<String, ActiveSession>>>;

/// Per-id locks that serialize attach and reset for one session
#[derive(Default)]
struct AttachLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AttachLocks {
    fn get(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Drop the lock for `session_id` once nobody else holds or waits on it
    fn release(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(session_id);
        }
    }
}

pub struct SessionManager {
    config: ClientConfig,
    transport: Arc<dyn PipelineTransport>,
    stream: StreamClient,
    coordinator: Arc<BackendCoordinator>,
    cache: Arc<ImageUrlCache>,
    bus: EventBus,
    sessions: SessionTable,
    attach_locks: AttachLocks,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn PipelineTransport>,
        channel: Arc<dyn EventChannel>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let bus = EventBus::new(config.event_bus_capacity);
        let coordinator = Arc::new(BackendCoordinator::from_config(
            &config,
            Arc::clone(&transport),
            store,
            bus.clone(),
        ));
        let router: Arc<dyn BackendRouter> = coordinator.clone();
        let stream = StreamClient::new(channel, Arc::clone(&transport), router, StreamConfig::from(&config));
        let cache = Arc::new(ImageUrlCache::new(
            Duration::from_secs(config.image_cache_ttl_secs),
            config.image_cache_capacity,
        ));
        Self {
            config,
            transport,
            stream,
            coordinator,
            cache,
            bus,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            attach_locks: AttachLocks::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Manager whose transport, channel and store are all one HTTP client
    pub fn http(config: ClientConfig) -> Result<Self> {
        let http = Arc::new(crate::transport::HttpTransport::new(&config)?);
        Ok(Self::new(config, http.clone(), http.clone(), http))
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<BackendCoordinator> {
        &self.coordinator
    }

    pub fn cache(&self) -> &Arc<ImageUrlCache> {
        &self.cache
    }

    /// Poll backend health until `token` is cancelled
    pub fn spawn_health_monitor(&self, token: CancellationToken) -> JoinHandle<()> {
        Arc::clone(self.coordinator.health()).spawn(token)
    }

    /// Upload `artifact`, then attach to the new session
    pub async fn start(&self, artifact: &Artifact) -> Result<SessionHandle> {
        let transport = &self.transport;
        let (session_id, backend) = self
            .coordinator
            .with_fallback(|backend| async move {
                transport
                    .start_session(artifact, backend)
                    .await
                    .map(|id| (id, backend))
            })
            .await?;

        info!(
            session_id = %session_id,
            backend = %backend,
            file = %artifact.file_name,
            bytes = artifact.bytes.len(),
            "Session started"
        );
        self.coordinator.assign(&session_id, backend);
        Ok(self.attach(&session_id).await)
    }

    /// Open the stream for `session_id`, replacing any stream already open
    /// for it
    pub async fn attach(&self, session_id: &str) -> SessionHandle {
        let lock = self.attach_locks.get(session_id);
        let handle = {
            let _guard = lock.lock().await;
            self.attach_locked(session_id).await
        };
        self.attach_locks.release(session_id, lock);
        handle
    }

    async fn attach_locked(&self, session_id: &str) -> SessionHandle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let previous = self.sessions.lock().await.remove(session_id);
        let carried = match previous {
            Some(active) => {
                debug!(session_id = %session_id, "Closing previous stream before attach");
                let state = active.shutdown().await;
                (!state.session.terminal).then(|| (*state).clone())
            }
            None => None,
        };

        let backend = self.coordinator.backend_for(session_id);
        let aggregator = match carried {
            Some(state) => ProgressAggregator::from_state(state),
            None => ProgressAggregator::new(Session::new(session_id, backend)),
        }
        .with_matcher(ImageMatcher::new(self.config.image_match.clone()))
        .with_cache(Arc::clone(&self.cache));

        let (worker, state_rx) = SessionWorker::new(aggregator, self.bus.clone());
        let stream = self.stream.open(session_id, worker);
        let token = stream.token();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let supervisor = tokio::spawn(supervise(
            stream,
            outcome_tx,
            Arc::clone(&self.sessions),
            Arc::clone(&self.coordinator),
            generation,
            self.config.completion_grace(),
        ));

        let displaced = self.sessions.lock().await.insert(
            session_id.to_string(),
            ActiveSession {
                generation,
                token,
                supervisor,
                state_rx: state_rx.clone(),
                outcome_rx: outcome_rx.clone(),
            },
        );
        if let Some(displaced) = displaced {
            warn!(session_id = %session_id, "Replaced a stream opened concurrently");
            displaced.shutdown().await;
        }
        info!(session_id = %session_id, backend = %backend, "Attached to session");

        SessionHandle {
            session_id: session_id.to_string(),
            backend,
            state_rx,
            outcome_rx,
            cache: Arc::clone(&self.cache),
        }
    }

    /// Close the session's stream and forget it. Returns false if the id
    /// was unknown.
    pub async fn reset(&self, session_id: &str) -> bool {
        let lock = self.attach_locks.get(session_id);
        let removed = {
            let _guard = lock.lock().await;
            let removed = self.sessions.lock().await.remove(session_id);
            self.coordinator.forget(session_id);
            match removed {
                Some(active) => {
                    active.shutdown().await;
                    info!(session_id = %session_id, "Session reset");
                    true
                }
                None => false,
            }
        };
        self.attach_locks.release(session_id, lock);
        removed
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<MenuSnapshot> {
        let state = self.state(session_id).await?;
        Some(resolver::resolve(&state, Some(&self.cache)))
    }

    pub async fn state(&self, session_id: &str) -> Option<Arc<AggregatorState>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.state_rx.borrow().clone())
    }

    pub async fn outcome(&self, session_id: &str) -> Option<SessionOutcome> {
        self.sessions
            .lock()
            .await
            .get(session_id)?
            .outcome_rx
            .borrow()
            .clone()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy the session's current state to `target` in the background
    pub async fn migrate(&self, session_id: &str, target: Backend) -> Option<JoinHandle<MigrationRecord>> {
        let state = self.state(session_id).await?;
        Some(
            self.coordinator
                .migrate_session(session_id, (*state).clone(), target),
        )
    }

    /// Close every stream
    pub async fn shutdown(&self) {
        let drained: Vec<ActiveSession> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for active in drained {
            active.shutdown().await;
        }
    }
}

async fn supervise(
    stream: StreamHandle,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    sessions: SessionTable,
    coordinator: Arc<BackendCoordinator>,
    generation: u64,
    grace: Duration,
) {
    let token = stream.token();
    let session_id = stream.session_id().to_string();

    let outcome = SessionOutcome::from(stream.wait().await);
    match &outcome {
        SessionOutcome::Failed { error } => warn!(session_id = %session_id, error = %error, "Session stream ended with error"),
        other => info!(session_id = %session_id, outcome = ?other, "Session stream ended"),
    }
    outcome_tx.send_replace(Some(outcome));

    // Cancelled means reset/re-attach; the canceller owns the table entry
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(grace) => {}
    }

    let mut sessions = sessions.lock().await;
    if sessions.get(&session_id).map(|s| s.generation) == Some(generation) {
        sessions.remove(&session_id);
        coordinator.forget(&session_id);
        debug!(session_id = %session_id, "Evicted session after grace period");
    }
}
