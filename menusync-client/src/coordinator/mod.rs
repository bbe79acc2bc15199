//! Backend health and fallback coordination
//!
//! Decides which of the two session backends serves each session:
//! 1. Pin (set after repeated primary failures) overrides everything
//! 2. Sessions already assigned (or migrated) stay where they are
//! 3. A backend the health monitor reports down is avoided
//! 4. Otherwise a deterministic rollout bucket picks durable for a
//!    configured share of sessions, and the primary for the rest
//!
//! Migration of a live session runs on its own task so the session's
//! event stream is never blocked.

pub mod fallback;
pub mod health;
pub mod migration;

pub use fallback::{Escalation, FallbackGuard};
pub use health::{HealthBoard, HealthMonitor, HealthSnapshot};
pub use migration::{validate_copy, MigrationOutcome, MigrationRecord};

use crate::aggregator::AggregatorState;
use crate::stream::BackendRouter;
use crate::transport::{PipelineTransport, SessionStore};
use menusync_common::config::ClientConfig;
use menusync_common::events::{EventBus, SessionUpdate};
use menusync_common::time;
use menusync_common::{Backend, Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinator tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub primary: Backend,
    /// 0-100; share of new sessions that prefer the durable backend
    pub durable_rollout_percent: u8,
    pub error_threshold: u32,
    /// Deadline for each guarded call
    pub request_timeout: Duration,
}

impl From<&ClientConfig> for CoordinatorConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            primary: config.primary_backend,
            durable_rollout_percent: config.durable_rollout_percent.min(100),
            error_threshold: config.fallback_error_threshold,
            request_timeout: config.request_timeout(),
        }
    }
}

/// Migration records kept per session; older ones are dropped first
pub const HISTORY_PER_SESSION: usize = 16;

/// Stable 0-99 bucket for a session id
pub fn rollout_bucket(session_id: &str) -> u8 {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

pub struct BackendCoordinator {
    config: CoordinatorConfig,
    health: Arc<HealthMonitor>,
    guard: FallbackGuard,
    store: Arc<dyn SessionStore>,
    bus: EventBus,
    /// Session id → backend currently serving it
    directory: RwLock<HashMap<String, Backend>>,
    history: Mutex<Vec<MigrationRecord>>,
}

impl BackendCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        health: Arc<HealthMonitor>,
        store: Arc<dyn SessionStore>,
        bus: EventBus,
    ) -> Self {
        let guard = FallbackGuard::new(config.primary, config.error_threshold).with_bus(bus.clone());
        Self {
            config,
            health,
            guard,
            store,
            bus,
            directory: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Coordinator with its own health monitor built from `config`
    pub fn from_config(
        config: &ClientConfig,
        transport: Arc<dyn PipelineTransport>,
        store: Arc<dyn SessionStore>,
        bus: EventBus,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(
            transport,
            config.health_poll_interval(),
            config.probe_timeout(),
        ));
        Self::new(CoordinatorConfig::from(config), health, store, bus)
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn guard(&self) -> &FallbackGuard {
        &self.guard
    }

    pub fn is_pinned(&self) -> bool {
        self.guard.is_pinned()
    }

    /// Operator action: stop routing everything to the secondary
    pub fn clear_rollback(&self) {
        self.guard.clear_pin();
    }

    /// Backend chosen by rollout alone
    pub fn preferred_backend(&self, session_id: &str) -> Backend {
        if rollout_bucket(session_id) < self.config.durable_rollout_percent {
            Backend::Durable
        } else {
            self.config.primary
        }
    }

    fn assigned(&self, session_id: &str) -> Option<Backend> {
        self.directory
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .copied()
    }

    /// Backend that should serve `session_id` right now
    pub fn backend_for(&self, session_id: &str) -> Backend {
        if self.guard.is_pinned() {
            return self.guard.active_backend();
        }
        if let Some(backend) = self.assigned(session_id) {
            return backend;
        }
        let preferred = self.preferred_backend(session_id);
        let board = self.health.snapshot();
        if !board.get(preferred).is_usable() && board.get(preferred.other()).is_usable() {
            debug!(
                session_id = %session_id,
                preferred = %preferred,
                "Preferred backend unavailable, using the other"
            );
            return preferred.other();
        }
        preferred
    }

    /// Record which backend serves `session_id`
    pub fn assign(&self, session_id: &str, backend: Backend) {
        self.directory
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.to_string(), backend);
    }

    /// Drop the session's assignment and migration history
    pub fn forget(&self, session_id: &str) {
        self.directory
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|r| r.session_id != session_id);
    }

    /// Run `op` against the primary with fallback to the secondary
    pub async fn with_fallback<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.guard.with_fallback(self.config.request_timeout, op).await
    }

    /// Migrate a live session on a background task
    pub fn migrate_session(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        state: AggregatorState,
        target: Backend,
    ) -> JoinHandle<MigrationRecord> {
        let coordinator = Arc::clone(self);
        let session_id = session_id.into();
        tokio::spawn(async move { coordinator.migrate_now(&session_id, &state, target).await })
    }

    /// Copy, read back, validate, then flip the session's backend pointer
    pub async fn migrate_now(&self, session_id: &str, state: &AggregatorState, target: Backend) -> MigrationRecord {
        let from = self.backend_for(session_id);
        let started_at = time::now();
        let migration_id = Uuid::new_v4();

        let outcome = if from == target {
            MigrationOutcome::Skipped {
                reason: format!("already on {}", target),
            }
        } else {
            info!(
                session_id = %session_id,
                migration_id = %migration_id,
                from = %from,
                to = %target,
                "Migrating session"
            );
            match self.copy_and_validate(session_id, state, target).await {
                Ok(()) => {
                    self.assign(session_id, target);
                    MigrationOutcome::Succeeded
                }
                Err(e) => MigrationOutcome::Failed {
                    reason: e.to_string(),
                },
            }
        };

        let record = MigrationRecord {
            migration_id,
            session_id: session_id.to_string(),
            from,
            to: target,
            started_at,
            finished_at: time::now(),
            outcome,
        };
        self.finish_migration(&record);
        record
    }

    async fn copy_and_validate(&self, session_id: &str, state: &AggregatorState, target: Backend) -> Result<()> {
        let budget = self.config.request_timeout;
        let mut copy = state.clone();
        copy.session.backend = target;

        tokio::time::timeout(budget, self.store.store_state(target, session_id, &copy))
            .await
            .map_err(|_| Error::Deadline {
                operation: format!("store session state on {}", target),
                budget_ms: budget.as_millis() as u64,
            })??;
        let read_back = tokio::time::timeout(budget, self.store.load_state(target, session_id))
            .await
            .map_err(|_| Error::Deadline {
                operation: format!("load session state from {}", target),
                budget_ms: budget.as_millis() as u64,
            })??;

        validate_copy(&copy, &read_back)
    }

    fn finish_migration(&self, record: &MigrationRecord) {
        match &record.outcome {
            MigrationOutcome::Succeeded => {
                info!(
                    session_id = %record.session_id,
                    from = %record.from,
                    to = %record.to,
                    elapsed_ms = time::millis_since(record.started_at),
                    "Session migrated"
                );
                self.bus.emit_lossy(SessionUpdate::MigrationSucceeded {
                    session_id: record.session_id.clone(),
                    from: record.from,
                    to: record.to,
                    timestamp: record.finished_at,
                });
            }
            MigrationOutcome::Failed { reason } => {
                warn!(
                    session_id = %record.session_id,
                    from = %record.from,
                    to = %record.to,
                    reason = %reason,
                    "Session migration failed, staying on source backend"
                );
                self.bus.emit_lossy(SessionUpdate::MigrationFailed {
                    session_id: record.session_id.clone(),
                    from: record.from,
                    to: record.to,
                    reason: reason.clone(),
                    timestamp: record.finished_at,
                });
            }
            MigrationOutcome::Skipped { reason } => {
                debug!(session_id = %record.session_id, reason = %reason, "Migration skipped");
                return;
            }
        }

        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push(record.clone());
        let kept = history.iter().filter(|r| r.session_id == record.session_id).count();
        if kept > HISTORY_PER_SESSION {
            if let Some(oldest) = history.iter().position(|r| r.session_id == record.session_id) {
                history.remove(oldest);
            }
        }
    }

    /// Move a session back to where its last successful migration took it
    /// from. Returns the backend it now points at.
    pub fn rollback_session(&self, session_id: &str) -> Option<Backend> {
        let previous = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|r| r.session_id == session_id && r.succeeded())
            .map(|r| r.from)?;
        if self.assigned(session_id) == Some(previous) {
            return Some(previous);
        }
        warn!(session_id = %session_id, backend = %previous, "Rolling session back");
        self.assign(session_id, previous);
        Some(previous)
    }

    /// Recorded migration attempts, oldest first (all sessions when
    /// `session_id` is None). Skipped attempts are not recorded.
    pub fn migration_history(&self, session_id: Option<&str>) -> Vec<MigrationRecord> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|r| session_id.map_or(true, |id| r.session_id == id))
            .cloned()
            .collect()
    }
}

impl BackendRouter for BackendCoordinator {
    fn backend_for(&self, session_id: &str) -> Backend {
        BackendCoordinator::backend_for(self, session_id)
    }

    fn record_error(&self, backend: Backend, error: &Error) {
        if backend == self.guard.primary() {
            debug!(backend = %backend, error = %error, "Counting primary backend error");
            self.guard.record_failure();
        }
    }

    fn record_success(&self, backend: Backend) {
        if backend == self.guard.primary() && self.guard.consecutive_errors() > 0 {
            self.guard.record_success();
        }
    }
}

#[cfg(test)]
mod tests;
