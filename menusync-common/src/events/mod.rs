//! Event types for menusync
//!
//! Two families live here:
//! - [`wire`]: what arrives on the push channel (decoded once, at the edge)
//! - [`SessionUpdate`]: what the client tells its observers after a message
//!   has been reconciled, broadcast through [`EventBus`]

pub mod wire;

pub use wire::{
    decode_message, CategoryItems, ChannelMessage, EnrichmentPayload, ImageEntry, MenuItem,
    StageEvent, StagePayload, StageStatus,
};

use crate::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Observer notifications
///
/// Emitted only when reconciliation actually changed something, so a
/// duplicate channel message produces no update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionUpdate {
    /// A stage record changed status or message
    StageChanged {
        session_id: String,
        stage: u8,
        status: StageStatus,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// First time a category name was seen in this session
    CategoryDiscovered {
        session_id: String,
        category: String,
        timestamp: DateTime<Utc>,
    },

    /// Enrichment moved on to a category
    CategoryProcessing {
        session_id: String,
        category: String,
        timestamp: DateTime<Utc>,
    },

    /// Partial items were added to a category
    ItemsAppended {
        session_id: String,
        category: String,
        added: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// A category received its authoritative final list
    CategoryCompleted {
        session_id: String,
        category: String,
        item_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Whole-session final menu arrived
    FinalMenuReceived {
        session_id: String,
        categories: usize,
        items: usize,
        timestamp: DateTime<Utc>,
    },

    /// Image urls were merged into items
    ImagesMerged {
        session_id: String,
        matched: usize,
        unmatched: usize,
        timestamp: DateTime<Utc>,
    },

    /// Stream client connection phase changed
    ConnectionChanged {
        session_id: String,
        phase: String,
        attempt: u32,
        backend: Backend,
        timestamp: DateTime<Utc>,
    },

    /// Session reached its terminal state
    SessionCompleted {
        session_id: String,
        /// Completed from partial data after a recoverable failure
        degraded: bool,
        timestamp: DateTime<Utc>,
    },

    /// Session ended with an unrecoverable error
    SessionFailed {
        session_id: String,
        stage: Option<u8>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Primary backend errors crossed the warning threshold
    BackendWarning {
        backend: Backend,
        consecutive_errors: u32,
        threshold: u32,
        timestamp: DateTime<Utc>,
    },

    /// All operations are now pinned to `backend`
    BackendPinned {
        backend: Backend,
        consecutive_errors: u32,
        timestamp: DateTime<Utc>,
    },

    /// Pin was cleared by an operator
    BackendPinCleared { timestamp: DateTime<Utc> },

    /// Session moved between backends
    MigrationSucceeded {
        session_id: String,
        from: Backend,
        to: Backend,
        timestamp: DateTime<Utc>,
    },

    /// Migration attempt left the session where it was
    MigrationFailed {
        session_id: String,
        from: Backend,
        to: Backend,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl SessionUpdate {
    /// Session this update belongs to, if it is session-scoped
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionUpdate::StageChanged { session_id, .. }
            | SessionUpdate::CategoryDiscovered { session_id, .. }
            | SessionUpdate::CategoryProcessing { session_id, .. }
            | SessionUpdate::ItemsAppended { session_id, .. }
            | SessionUpdate::CategoryCompleted { session_id, .. }
            | SessionUpdate::FinalMenuReceived { session_id, .. }
            | SessionUpdate::ImagesMerged { session_id, .. }
            | SessionUpdate::ConnectionChanged { session_id, .. }
            | SessionUpdate::SessionCompleted { session_id, .. }
            | SessionUpdate::SessionFailed { session_id, .. }
            | SessionUpdate::MigrationSucceeded { session_id, .. }
            | SessionUpdate::MigrationFailed { session_id, .. } => Some(session_id),
            SessionUpdate::BackendWarning { .. }
            | SessionUpdate::BackendPinned { .. }
            | SessionUpdate::BackendPinCleared { .. } => None,
        }
    }

    /// Event type name (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionUpdate::StageChanged { .. } => "StageChanged",
            SessionUpdate::CategoryDiscovered { .. } => "CategoryDiscovered",
            SessionUpdate::CategoryProcessing { .. } => "CategoryProcessing",
            SessionUpdate::ItemsAppended { .. } => "ItemsAppended",
            SessionUpdate::CategoryCompleted { .. } => "CategoryCompleted",
            SessionUpdate::FinalMenuReceived { .. } => "FinalMenuReceived",
            SessionUpdate::ImagesMerged { .. } => "ImagesMerged",
            SessionUpdate::ConnectionChanged { .. } => "ConnectionChanged",
            SessionUpdate::SessionCompleted { .. } => "SessionCompleted",
            SessionUpdate::SessionFailed { .. } => "SessionFailed",
            SessionUpdate::BackendWarning { .. } => "BackendWarning",
            SessionUpdate::BackendPinned { .. } => "BackendPinned",
            SessionUpdate::BackendPinCleared { .. } => "BackendPinCleared",
            SessionUpdate::MigrationSucceeded { .. } => "MigrationSucceeded",
            SessionUpdate::MigrationFailed { .. } => "MigrationFailed",
        }
    }
}

/// Broadcast bus for [`SessionUpdate`]
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block reconciliation)
/// - Multiple concurrent subscribers
/// - Lagged subscribers are told how many updates they missed
///
/// # Examples
///
/// ```
/// use menusync_common::events::{EventBus, SessionUpdate};
///
/// let bus = EventBus::new(64);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(SessionUpdate::BackendPinCleared {
///     timestamp: chrono::Utc::now(),
/// });
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionUpdate>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` updates per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future updates
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.tx.subscribe()
    }

    /// Emit an update to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` otherwise.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        update: SessionUpdate,
    ) -> Result<usize, broadcast::error::SendError<SessionUpdate>> {
        self.tx.send(update)
    }

    /// Emit an update, ignoring the no-subscriber case
    pub fn emit_lossy(&self, update: SessionUpdate) {
        let _ = self.tx.send(update);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
