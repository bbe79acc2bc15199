//! Bridges one session's stream to its aggregator

use crate::aggregator::{stage_label, AggregatorState, ApplyOutcome, ProgressAggregator, Recovery};
use crate::stream::{ConnectionPhase, Directive, FailureResolution, StreamHandler};
use chrono::Utc;
use menusync_common::events::{EventBus, SessionUpdate, StageEvent};
use menusync_common::{Backend, Error};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Applies events in arrival order, forwards updates to the bus and
/// publishes each changed state
pub struct SessionWorker {
    aggregator: ProgressAggregator,
    bus: EventBus,
    state_tx: watch::Sender<Arc<AggregatorState>>,
}

impl SessionWorker {
    pub fn new(aggregator: ProgressAggregator, bus: EventBus) -> (Self, watch::Receiver<Arc<AggregatorState>>) {
        let (state_tx, state_rx) = watch::channel(Arc::new(aggregator.state().clone()));
        (
            Self {
                aggregator,
                bus,
                state_tx,
            },
            state_rx,
        )
    }

    pub fn aggregator(&self) -> &ProgressAggregator {
        &self.aggregator
    }

    fn publish(&self, outcome: ApplyOutcome) {
        if !outcome.changed() {
            return;
        }
        for update in outcome.updates {
            self.bus.emit_lossy(update);
        }
        self.state_tx
            .send_replace(Arc::new(self.aggregator.state().clone()));
    }
}

impl StreamHandler for SessionWorker {
    fn on_event(&mut self, event: StageEvent) -> Directive {
        debug!(
            session_id = %self.aggregator.session().id,
            stage = event.stage,
            stage_label = stage_label(event.stage),
            status = ?event.status,
            "Stage event"
        );
        let mut outcome = self.aggregator.apply(&event);
        let terminal = outcome.terminal;
        let fatal = outcome.fatal.take();
        self.publish(outcome);

        match fatal {
            Some(e) => Directive::Fail(e),
            None if terminal => Directive::Close {
                degraded: self.aggregator.session().degraded,
            },
            None => Directive::Continue,
        }
    }

    fn current_stage(&self) -> u8 {
        self.aggregator.session().current_stage
    }

    fn on_failure(&mut self, error: &Error, soft: bool) -> FailureResolution {
        let session = self.aggregator.session();
        if session.terminal {
            return if session.is_failed() {
                FailureResolution::Fatal
            } else {
                FailureResolution::Recovered
            };
        }
        if soft {
            match self.aggregator.recover(error) {
                Recovery::Degraded(outcome) => {
                    self.publish(outcome);
                    FailureResolution::Recovered
                }
                Recovery::Failed(outcome) => {
                    self.publish(outcome);
                    FailureResolution::Fatal
                }
                Recovery::AlreadyTerminal => FailureResolution::Recovered,
            }
        } else {
            if let Some(outcome) = self.aggregator.fail(error) {
                self.publish(outcome);
            }
            FailureResolution::Fatal
        }
    }

    fn on_connection(&mut self, phase: ConnectionPhase, attempt: u32, backend: Backend) {
        if phase == ConnectionPhase::Open && self.aggregator.session().backend != backend {
            self.aggregator.set_backend(backend);
            self.state_tx
                .send_replace(Arc::new(self.aggregator.state().clone()));
        }
        self.bus.emit_lossy(SessionUpdate::ConnectionChanged {
            session_id: self.aggregator.session().id.clone(),
            phase: phase.to_string(),
            attempt,
            backend,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use menusync_common::events::{decode_message, ChannelMessage};

    fn event(raw: &str) -> StageEvent {
        match decode_message(raw).unwrap() {
            ChannelMessage::Stage(ev) => ev,
            other => panic!("not a stage event: {:?}", other),
        }
    }

    fn new_worker() -> (SessionWorker, watch::Receiver<Arc<AggregatorState>>, EventBus) {
        let bus = EventBus::new(64);
        let agg = ProgressAggregator::new(Session::new("w1", Backend::Ephemeral));
        let (worker, rx) = SessionWorker::new(agg, bus.clone());
        (worker, rx, bus)
    }

    #[test]
    fn test_duplicate_event_publishes_once() {
        let (mut worker, mut rx, bus) = new_worker();
        let mut updates = bus.subscribe();
        rx.borrow_and_update();

        let ev = event(r#"{"stage":2,"status":"completed","categories":{"Mains":[{"id":"m1","source_text":"a"}]}}"#);
        assert!(matches!(worker.on_event(ev.clone()), Directive::Continue));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        while updates.try_recv().is_ok() {}

        assert!(matches!(worker.on_event(ev), Directive::Continue));
        assert!(!rx.has_changed().unwrap());
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_stage_six_closes() {
        let (mut worker, rx, _) = new_worker();
        let directive = worker.on_event(event(r#"{"stage":6,"status":"completed"}"#));
        assert!(matches!(directive, Directive::Close { degraded: false }));
        assert!(rx.borrow().session.terminal);
    }

    #[test]
    fn test_pipeline_error_without_data_fails() {
        let (mut worker, _, _) = new_worker();
        let directive = worker.on_event(event(r#"{"stage":1,"status":"error","message":"ocr crashed"}"#));
        assert!(matches!(directive, Directive::Fail(Error::Pipeline { stage: 1, .. })));
    }

    #[test]
    fn test_soft_and_hard_failures() {
        let (mut worker, rx, _) = new_worker();
        worker.on_event(event(
            r#"{"stage":4,"status":"active","chunk_result":{"category":"Mains","items":[{"id":"m1","source_text":"a"}]}}"#,
        ));
        let timeout = Error::Timeout {
            stage: 4,
            idle_ms: 10,
        };
        assert_eq!(worker.on_failure(&timeout, true), FailureResolution::Recovered);
        assert!(rx.borrow().session.degraded);
        // Later failures do not undo the recovery
        assert_eq!(worker.on_failure(&timeout, false), FailureResolution::Recovered);
        assert!(!rx.borrow().session.is_failed());

        let (mut fresh, rx, _) = new_worker();
        assert_eq!(fresh.on_failure(&timeout, false), FailureResolution::Fatal);
        assert!(rx.borrow().session.is_failed());
    }

    #[test]
    fn test_connection_open_records_backend() {
        let (mut worker, rx, bus) = new_worker();
        let mut updates = bus.subscribe();
        worker.on_connection(ConnectionPhase::Open, 0, Backend::Durable);
        assert_eq!(rx.borrow().session.backend, Backend::Durable);
        assert!(matches!(
            updates.try_recv().unwrap(),
            SessionUpdate::ConnectionChanged { backend: Backend::Durable, .. }
        ));
    }
}
