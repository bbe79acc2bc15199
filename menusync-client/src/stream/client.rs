//! Stream client run loop
//!
//! Per session, a single task selects over three things: the next channel
//! message, the idle timer of the current stage and the cancellation token.
//!
//! **Message handling:**
//! - `ping`: answered with a detached pong call; failures are logged only
//! - `heartbeat`: resets the idle timer, nothing else
//! - malformed: logged and skipped
//! - stage event: handed to the [`StreamHandler`]
//!
//! **Failure handling:**
//! - idle timeout: handed to the handler (soft recovery only for the
//!   configured stages)
//! - transport error or server close: reconnect after a fixed delay, up to
//!   the configured number of attempts; a received stage event resets the
//!   count (keep-alives do not)
//! - reconnect budget spent: handed to the handler (soft recovery allowed)

use super::connection::{ConnectionPhase, ConnectionState};
use super::{BackendRouter, Directive, FailureResolution, StreamHandle, StreamHandler, StreamOutcome};
use crate::transport::{EventChannel, MessageStream, PipelineTransport};
use futures::StreamExt;
use menusync_common::config::{ClientConfig, StageTimeouts};
use menusync_common::events::{decode_message, ChannelMessage};
use menusync_common::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stream client tuning
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub stage_timeouts: StageTimeouts,
    /// Stages whose idle timeout may complete the session from partial data
    pub soft_timeout_stages: Vec<u8>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for StreamConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            stage_timeouts: config.stage_timeouts.clone(),
            soft_timeout_stages: config.soft_timeout_stages.clone(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

#[derive(Clone)]
pub struct StreamClient {
    channel: Arc<dyn EventChannel>,
    transport: Arc<dyn PipelineTransport>,
    router: Arc<dyn BackendRouter>,
    config: StreamConfig,
}

/// Next step after a connection-level failure
enum Next {
    Retry,
    Done(StreamOutcome),
}

impl StreamClient {
    pub fn new(
        channel: Arc<dyn EventChannel>,
        transport: Arc<dyn PipelineTransport>,
        router: Arc<dyn BackendRouter>,
        config: StreamConfig,
    ) -> Self {
        Self {
            channel,
            transport,
            router,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start streaming `session_id` into `handler` on a new task
    pub fn open<H: StreamHandler>(&self, session_id: impl Into<String>, handler: H) -> StreamHandle {
        let session_id = session_id.into();
        let token = CancellationToken::new();
        let client = self.clone();
        let task = tokio::spawn({
            let session_id = session_id.clone();
            let token = token.clone();
            async move { client.run(session_id, handler, token).await }
        });
        StreamHandle::new(session_id, token, task)
    }

    async fn run<H: StreamHandler>(&self, session_id: String, mut handler: H, token: CancellationToken) -> StreamOutcome {
        let initial_backend = self.router.backend_for(&session_id);
        let mut conn = ConnectionState::new(
            session_id.clone(),
            initial_backend,
            self.config.stage_timeouts.for_stage(handler.current_stage()),
        );

        let outcome = loop {
            if token.is_cancelled() {
                break StreamOutcome::Cancelled;
            }

            let backend = self.router.backend_for(&session_id);
            let phase = if conn.attempt == 0 {
                ConnectionPhase::Connecting
            } else {
                ConnectionPhase::Reconnecting
            };
            handler.on_connection(phase, conn.attempt, backend);

            let connected = tokio::select! {
                _ = token.cancelled() => break StreamOutcome::Cancelled,
                res = self.channel.connect(&session_id, backend) => res,
            };
            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => match self.after_failure(&mut conn, backend, e, &mut handler, &token).await {
                    Next::Retry => continue,
                    Next::Done(outcome) => break outcome,
                },
            };

            conn.on_open(backend);
            handler.on_connection(ConnectionPhase::Open, conn.attempt, backend);
            info!(
                session_id = %session_id,
                backend = %backend,
                attempt = conn.attempt,
                "Event stream open"
            );

            match self.pump(&mut conn, stream, &mut handler, &token).await {
                Ok(outcome) => break outcome,
                Err(e) => match self.after_failure(&mut conn, backend, e, &mut handler, &token).await {
                    Next::Retry => continue,
                    Next::Done(outcome) => break outcome,
                },
            }
        };

        if conn.close() {
            handler.on_connection(ConnectionPhase::Closed, conn.attempt, conn.backend);
            debug!(
                session_id = %session_id,
                messages = conn.messages,
                outcome = ?outcome,
                "Event stream closed"
            );
        }
        outcome
    }

    /// Read messages until the session ends (`Ok`) or the connection fails
    /// (`Err`, eligible for reconnect)
    async fn pump<H: StreamHandler>(
        &self,
        conn: &mut ConnectionState,
        mut stream: MessageStream,
        handler: &mut H,
        token: &CancellationToken,
    ) -> Result<StreamOutcome, Error> {
        loop {
            if token.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }
            let idle = conn.idle_timeout;

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamOutcome::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            let raw = match next {
                Err(_elapsed) => return Ok(self.on_idle_timeout(conn, idle, handler)),
                Ok(None) => {
                    return Err(Error::Transport {
                        stage: handler.current_stage(),
                        message: "event stream closed by server".to_string(),
                    })
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(raw))) => raw,
            };

            conn.on_message();
            self.router.record_success(conn.backend);

            match decode_message(&raw) {
                Err(e) => {
                    warn!(
                        session_id = %conn.session_id,
                        error = %e,
                        "Skipping malformed channel message"
                    );
                }
                Ok(ChannelMessage::Heartbeat) => {
                    debug!(session_id = %conn.session_id, "Heartbeat");
                }
                Ok(ChannelMessage::Ping) => self.send_pong(&conn.session_id, token),
                Ok(ChannelMessage::Stage(event)) => {
                    conn.on_progress();
                    match handler.on_event(event) {
                        Directive::Continue => {}
                        Directive::Close { degraded } => return Ok(StreamOutcome::Completed { degraded }),
                        Directive::Fail(e) => {
                            error!(session_id = %conn.session_id, error = %e, "Session failed");
                            return Ok(StreamOutcome::Failed(e));
                        }
                    }
                }
            }

            conn.idle_timeout = self.config.stage_timeouts.for_stage(handler.current_stage());
        }
    }

    fn on_idle_timeout<H: StreamHandler>(&self, conn: &ConnectionState, idle: Duration, handler: &mut H) -> StreamOutcome {
        let stage = handler.current_stage();
        let soft = self.config.soft_timeout_stages.contains(&stage);
        let err = Error::Timeout {
            stage,
            idle_ms: idle.as_millis() as u64,
        };
        warn!(
            session_id = %conn.session_id,
            stage = stage,
            idle_ms = idle.as_millis() as u64,
            soft_recovery = soft,
            "No event within stage idle budget"
        );
        match handler.on_failure(&err, soft) {
            FailureResolution::Recovered => StreamOutcome::Completed { degraded: true },
            FailureResolution::Fatal => StreamOutcome::Failed(err),
        }
    }

    /// Fixed-delay reconnect, bounded by `reconnect_attempts`
    async fn after_failure<H: StreamHandler>(
        &self,
        conn: &mut ConnectionState,
        backend: menusync_common::Backend,
        err: Error,
        handler: &mut H,
        token: &CancellationToken,
    ) -> Next {
        self.router.record_error(backend, &err);
        if token.is_cancelled() {
            return Next::Done(StreamOutcome::Cancelled);
        }

        let attempt = conn.begin_reconnect();
        let max_attempts = self.config.reconnect_attempts;
        if attempt > max_attempts {
            let stage = handler.current_stage();
            let fatal = Error::ReconnectExhausted {
                stage,
                attempts: max_attempts,
                last_error: err.to_string(),
            };
            error!(
                session_id = %conn.session_id,
                stage = stage,
                attempts = max_attempts,
                error = %err,
                "Event stream lost, reconnect attempts exhausted"
            );
            return Next::Done(match handler.on_failure(&fatal, true) {
                FailureResolution::Recovered => StreamOutcome::Completed { degraded: true },
                FailureResolution::Fatal => StreamOutcome::Failed(fatal),
            });
        }

        warn!(
            session_id = %conn.session_id,
            attempt,
            max_attempts,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            error = %err,
            "Event stream failed, will reconnect after delay"
        );

        tokio::select! {
            _ = token.cancelled() => Next::Done(StreamOutcome::Cancelled),
            _ = tokio::time::sleep(self.config.reconnect_delay) => Next::Retry,
        }
    }

    /// Answer a ping without blocking the read loop
    fn send_pong(&self, session_id: &str, token: &CancellationToken) {
        let transport = self.transport.clone();
        let session_id = session_id.to_string();
        let token = token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                res = transport.pong(&session_id) => res,
            };
            match result {
                Ok(()) => debug!(session_id = %session_id, "Pong sent"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Pong failed (not retried)"),
            }
        });
    }
}
