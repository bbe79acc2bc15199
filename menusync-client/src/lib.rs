//! menusync client library
//!
//! Follows one menu-processing session through its six pipeline stages and
//! keeps a consistent, best-available view of the menu while it runs.
//!
//! **Layers:**
//! - [`stream`]: push channel lifecycle (idle budgets, pings, reconnects)
//! - [`aggregator`]: folds stage events into one monotonic state
//! - [`resolver`]: derives the menu snapshot shown to users
//! - [`coordinator`]: backend health, fallback, pinning and migration
//! - [`session`]: ties the above together per session id

pub mod aggregator;
pub mod coordinator;
pub mod images;
pub mod models;
pub mod resolver;
pub mod session;
pub mod stream;
pub mod transport;

pub use aggregator::{AggregatorState, ProgressAggregator};
pub use coordinator::BackendCoordinator;
pub use resolver::{resolve, MenuSnapshot};
pub use session::{SessionHandle, SessionManager, SessionOutcome};
pub use stream::{StreamClient, StreamHandle, StreamOutcome};
pub use transport::{Artifact, HttpTransport};
