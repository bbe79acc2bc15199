//! Push channel client
//!
//! One [`StreamClient::open`] call owns one session's channel for its whole
//! life: it connects, decodes messages, answers pings, enforces per-stage
//! idle budgets, reconnects after transport failures and closes exactly
//! once. What a stage event *means* is left to the [`StreamHandler`].

pub mod client;
pub mod connection;

pub use client::{StreamClient, StreamConfig};
pub use connection::{ConnectionPhase, ConnectionState};

use menusync_common::events::StageEvent;
use menusync_common::{Backend, Error};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the handler wants after an event
#[derive(Debug)]
pub enum Directive {
    Continue,
    /// Session is terminal; close the channel
    Close { degraded: bool },
    /// Session failed; close the channel and surface the error
    Fail(Error),
}

/// Answer to a failure the stream client cannot fix itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureResolution {
    /// Session completed from partial data
    Recovered,
    /// Nothing to fall back to
    Fatal,
}

/// Receives everything the channel produces for one session
pub trait StreamHandler: Send + 'static {
    fn on_event(&mut self, event: StageEvent) -> Directive;

    /// Stage whose idle budget applies while waiting
    fn current_stage(&self) -> u8;

    /// An idle timeout or exhausted reconnect budget. `soft` tells whether
    /// the session may be completed from partial data.
    fn on_failure(&mut self, error: &Error, soft: bool) -> FailureResolution;

    fn on_connection(&mut self, _phase: ConnectionPhase, _attempt: u32, _backend: Backend) {}
}

/// Picks the backend for each (re)connect and hears how it went
pub trait BackendRouter: Send + Sync {
    fn backend_for(&self, session_id: &str) -> Backend;

    fn record_error(&self, _backend: Backend, _error: &Error) {}

    fn record_success(&self, _backend: Backend) {}
}

/// Always the same backend
#[derive(Debug, Clone, Copy)]
pub struct FixedBackend(pub Backend);

impl BackendRouter for FixedBackend {
    fn backend_for(&self, _session_id: &str) -> Backend {
        self.0
    }
}

/// How a stream ended
#[derive(Debug)]
pub enum StreamOutcome {
    Completed { degraded: bool },
    Cancelled,
    Failed(Error),
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamOutcome::Completed { .. })
    }
}

/// Handle to a running stream
#[derive(Debug)]
pub struct StreamHandle {
    session_id: String,
    token: CancellationToken,
    task: JoinHandle<StreamOutcome>,
}

impl StreamHandle {
    pub(crate) fn new(session_id: String, token: CancellationToken, task: JoinHandle<StreamOutcome>) -> Self {
        Self {
            session_id,
            token,
            task,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Request shutdown; safe to call any number of times
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Clone of the cancellation token (for tying other work to this stream)
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the stream to end
    pub async fn wait(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => StreamOutcome::Cancelled,
            Err(e) => StreamOutcome::Failed(Error::Internal(format!("stream task panicked: {}", e))),
        }
    }
}
