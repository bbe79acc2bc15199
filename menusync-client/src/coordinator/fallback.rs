//! Primary/secondary fallback with error-count pinning
//!
//! Every guarded operation runs on the primary backend first, under a
//! deadline. A failure there is counted and the operation is retried once
//! on the secondary. Consecutive primary failures escalate:
//! - `threshold`: warning (logged and broadcast once per streak)
//! - `2 × threshold`: all operations pinned to the secondary until an
//!   operator clears the pin
//!
//! A primary success ends the streak.

use chrono::Utc;
use menusync_common::events::{EventBus, SessionUpdate};
use menusync_common::{Backend, Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Escalation caused by one recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    Warning,
    Pinned,
}

pub struct FallbackGuard {
    primary: Backend,
    threshold: u32,
    consecutive: AtomicU32,
    warned: AtomicBool,
    pinned: AtomicBool,
    bus: Option<EventBus>,
}

impl FallbackGuard {
    pub fn new(primary: Backend, threshold: u32) -> Self {
        Self {
            primary,
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
            warned: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn primary(&self) -> Backend {
        self.primary
    }

    pub fn secondary(&self) -> Backend {
        self.primary.other()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    /// Backend new work should go to
    pub fn active_backend(&self) -> Backend {
        if self.is_pinned() {
            self.secondary()
        } else {
            self.primary
        }
    }

    /// Count one primary failure and escalate if a threshold was reached
    pub fn record_failure(&self) -> Escalation {
        let count = self.consecutive.fetch_add(1, Ordering::SeqCst).saturating_add(1);

        if count >= self.threshold.saturating_mul(2) && !self.pinned.swap(true, Ordering::SeqCst) {
            error!(
                primary = %self.primary,
                pinned_to = %self.secondary(),
                consecutive_errors = count,
                "Primary backend failing repeatedly, pinning all operations to secondary"
            );
            self.emit(SessionUpdate::BackendPinned {
                backend: self.secondary(),
                consecutive_errors: count,
                timestamp: Utc::now(),
            });
            return Escalation::Pinned;
        }

        if count >= self.threshold && !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                primary = %self.primary,
                consecutive_errors = count,
                threshold = self.threshold,
                "Primary backend error threshold reached"
            );
            self.emit(SessionUpdate::BackendWarning {
                backend: self.primary,
                consecutive_errors: count,
                threshold: self.threshold,
                timestamp: Utc::now(),
            });
            return Escalation::Warning;
        }
        Escalation::None
    }

    /// A primary success ends the current error streak
    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
        self.warned.store(false, Ordering::SeqCst);
    }

    /// Operator action: route to the primary again
    pub fn clear_pin(&self) {
        let was_pinned = self.pinned.swap(false, Ordering::SeqCst);
        self.record_success();
        if was_pinned {
            info!(primary = %self.primary, "Backend pin cleared");
            self.emit(SessionUpdate::BackendPinCleared {
                timestamp: Utc::now(),
            });
        }
    }

    /// Run `op` on the primary, falling back to the secondary on failure.
    ///
    /// While pinned only the secondary runs. When both fail the primary's
    /// error is returned.
    pub async fn with_fallback<T, F, Fut>(&self, budget: Duration, op: F) -> Result<T>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_pinned() {
            return deadline(self.secondary(), budget, op(self.secondary())).await;
        }

        match deadline(self.primary, budget, op(self.primary)).await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(primary_err) => {
                self.record_failure();
                warn!(
                    primary = %self.primary,
                    error = %primary_err,
                    "Primary backend failed, trying secondary"
                );
                match deadline(self.secondary(), budget, op(self.secondary())).await {
                    Ok(value) => Ok(value),
                    Err(secondary_err) => {
                        error!(
                            primary_error = %primary_err,
                            secondary_error = %secondary_err,
                            "Both backends failed"
                        );
                        Err(primary_err)
                    }
                }
            }
        }
    }

    fn emit(&self, update: SessionUpdate) {
        if let Some(bus) = &self.bus {
            bus.emit_lossy(update);
        }
    }
}

async fn deadline<T>(backend: Backend, budget: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Deadline {
            operation: format!("{} backend call", backend),
            budget_ms: budget.as_millis() as u64,
        }),
    }
}
