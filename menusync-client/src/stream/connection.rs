//! Connection state for one push channel

use menusync_common::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Reconnecting => "reconnecting",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub session_id: String,
    pub backend: Backend,
    pub phase: ConnectionPhase,
    /// Reconnect attempts since the last stage event was received
    pub attempt: u32,
    pub last_event_at: Option<Instant>,
    /// Idle budget of the stage currently being waited on
    pub idle_timeout: Duration,
    /// Messages received over the lifetime of the connection
    pub messages: u64,
}

impl ConnectionState {
    pub fn new(session_id: impl Into<String>, backend: Backend, idle_timeout: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            backend,
            phase: ConnectionPhase::Connecting,
            attempt: 0,
            last_event_at: None,
            idle_timeout,
            messages: 0,
        }
    }

    pub fn on_open(&mut self, backend: Backend) {
        self.backend = backend;
        self.phase = ConnectionPhase::Open;
    }

    /// Count an inbound message of any kind (keep-alives included)
    pub fn on_message(&mut self) {
        self.messages += 1;
        self.last_event_at = Some(Instant::now());
    }

    /// A stage event arrived, so the reconnect budget starts over
    pub fn on_progress(&mut self) {
        self.attempt = 0;
    }

    /// Count one more reconnect attempt and return it (1-based)
    pub fn begin_reconnect(&mut self) -> u32 {
        self.attempt += 1;
        self.phase = ConnectionPhase::Reconnecting;
        self.attempt
    }

    /// Move to `Closed`. Returns true only the first time.
    pub fn close(&mut self) -> bool {
        if self.phase == ConnectionPhase::Closed {
            return false;
        }
        self.phase = ConnectionPhase::Closed;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_progress_resets_attempts() {
        let mut conn = ConnectionState::new("s1", Backend::Ephemeral, Duration::from_secs(1));
        assert_eq!(conn.begin_reconnect(), 1);
        assert_eq!(conn.begin_reconnect(), 2);
        assert_eq!(conn.phase, ConnectionPhase::Reconnecting);
        conn.on_open(Backend::Durable);
        conn.on_message();
        assert_eq!(conn.attempt, 2);
        assert_eq!(conn.messages, 1);
        assert!(conn.last_event_at.is_some());

        conn.on_message();
        conn.on_progress();
        assert_eq!(conn.attempt, 0);
        assert_eq!(conn.backend, Backend::Durable);
        assert_eq!(conn.messages, 2);
    }

    #[test]
    fn test_close_once() {
        let mut conn = ConnectionState::new("s1", Backend::Ephemeral, Duration::from_secs(1));
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
    }
}
