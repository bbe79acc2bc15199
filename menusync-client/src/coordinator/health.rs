//! Backend health polling
//!
//! Both backends are probed concurrently, each under its own timeout, and
//! the results replace the published [`HealthBoard`] in one step so readers
//! never see one backend's new result next to the other's old one. A poll
//! requested while the last one is younger than the interval is skipped.

use crate::transport::PipelineTransport;
use chrono::{DateTime, Utc};
use menusync_common::{Backend, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last probe result for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub backend: Backend,
    pub available: bool,
    pub latency_ms: Option<u64>,
    pub checked_at: Option<DateTime<Utc>>,
    /// Failed probes in a row
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    /// Never probed; treated as usable until a probe says otherwise
    pub fn unknown(backend: Backend) -> Self {
        Self {
            backend,
            available: true,
            latency_ms: None,
            checked_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.checked_at.is_none() || self.available
    }

    /// Higher is healthier; 0 when unavailable. Latency and recent failures
    /// both count against the score.
    pub fn score(&self) -> u32 {
        if !self.available {
            return 0;
        }
        let latency_penalty = self.latency_ms.map(|ms| (ms / 10).min(500) as u32).unwrap_or(0);
        let failure_penalty = self.consecutive_failures.saturating_mul(100);
        1000u32
            .saturating_sub(latency_penalty)
            .saturating_sub(failure_penalty)
            .max(1)
    }

    fn next(&self, probe: &Result<Duration>) -> Self {
        match probe {
            Ok(latency) => Self {
                backend: self.backend,
                available: true,
                latency_ms: Some(latency.as_millis() as u64),
                checked_at: Some(Utc::now()),
                consecutive_failures: 0,
                last_error: None,
            },
            Err(e) => Self {
                backend: self.backend,
                available: false,
                latency_ms: None,
                checked_at: Some(Utc::now()),
                consecutive_failures: self.consecutive_failures.saturating_add(1),
                last_error: Some(e.to_string()),
            },
        }
    }
}

/// Health of both backends, published as one value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBoard {
    pub ephemeral: HealthSnapshot,
    pub durable: HealthSnapshot,
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self {
            ephemeral: HealthSnapshot::unknown(Backend::Ephemeral),
            durable: HealthSnapshot::unknown(Backend::Durable),
        }
    }
}

impl HealthBoard {
    pub fn get(&self, backend: Backend) -> &HealthSnapshot {
        match backend {
            Backend::Ephemeral => &self.ephemeral,
            Backend::Durable => &self.durable,
        }
    }

    /// Healthier backend by score; ties go to `preferred`
    pub fn healthiest(&self, preferred: Backend) -> Backend {
        let other = preferred.other();
        if self.get(other).score() > self.get(preferred).score() {
            other
        } else {
            preferred
        }
    }
}

pub struct HealthMonitor {
    transport: Arc<dyn PipelineTransport>,
    interval: Duration,
    probe_timeout: Duration,
    tx: watch::Sender<HealthBoard>,
    last_poll: Mutex<Option<Instant>>,
}

impl HealthMonitor {
    pub fn new(transport: Arc<dyn PipelineTransport>, interval: Duration, probe_timeout: Duration) -> Self {
        let (tx, _) = watch::channel(HealthBoard::default());
        Self {
            transport,
            interval,
            probe_timeout,
            tx,
            last_poll: Mutex::new(None),
        }
    }

    /// Current board (cheap clone)
    pub fn snapshot(&self) -> HealthBoard {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthBoard> {
        self.tx.subscribe()
    }

    /// Probe both backends unless the last poll is younger than the
    /// interval (`force` ignores that). Returns true if a poll ran.
    pub async fn poll_once(&self, force: bool) -> bool {
        {
            let mut last = self
                .last_poll
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(at) = *last {
                if !force && at.elapsed() < self.interval {
                    debug!("Skipping health poll, last result still fresh");
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        let (ephemeral, durable) = tokio::join!(
            self.probe(Backend::Ephemeral),
            self.probe(Backend::Durable)
        );

        let previous = self.snapshot();
        let board = HealthBoard {
            ephemeral: previous.ephemeral.next(&ephemeral),
            durable: previous.durable.next(&durable),
        };
        for snapshot in [&board.ephemeral, &board.durable] {
            let was = previous.get(snapshot.backend).available;
            if was && !snapshot.available {
                warn!(
                    backend = %snapshot.backend,
                    error = snapshot.last_error.as_deref().unwrap_or(""),
                    "Backend became unavailable"
                );
            } else if !was && snapshot.available {
                info!(backend = %snapshot.backend, "Backend available again");
            }
        }
        self.tx.send_replace(board);
        true
    }

    async fn probe(&self, backend: Backend) -> Result<Duration> {
        match tokio::time::timeout(self.probe_timeout, self.transport.probe(backend)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Deadline {
                operation: format!("{} health probe", backend),
                budget_ms: self.probe_timeout.as_millis() as u64,
            }),
        }
    }

    /// Poll on the configured interval until `token` is cancelled
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.poll_once(false).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_orders_backends() {
        let mut board = HealthBoard::default();
        assert_eq!(board.healthiest(Backend::Ephemeral), Backend::Ephemeral);

        board.ephemeral.available = false;
        board.ephemeral.checked_at = Some(Utc::now());
        assert!(!board.ephemeral.is_usable());
        assert_eq!(board.ephemeral.score(), 0);
        assert_eq!(board.healthiest(Backend::Ephemeral), Backend::Durable);

        let slow = HealthSnapshot {
            latency_ms: Some(2_000),
            ..HealthSnapshot::unknown(Backend::Durable)
        };
        let fast = HealthSnapshot {
            latency_ms: Some(20),
            ..HealthSnapshot::unknown(Backend::Durable)
        };
        assert!(fast.score() > slow.score());
    }

    #[test]
    fn test_failures_accumulate() {
        let start = HealthSnapshot::unknown(Backend::Durable);
        let err: Result<Duration> = Err(Error::Transport {
            stage: 0,
            message: "refused".into(),
        });
        let once = start.next(&err);
        let twice = once.next(&err);
        assert_eq!(twice.consecutive_failures, 2);
        assert!(!twice.available);
        let healed = twice.next(&Ok(Duration::from_millis(5)));
        assert_eq!(healed.consecutive_failures, 0);
        assert_eq!(healed.latency_ms, Some(5));
    }
}
