//! Session management: one stream, one aggregator and one published state
//! per session id

pub mod manager;
pub mod worker;

pub use manager::{SessionHandle, SessionManager, SessionOutcome};
pub use worker::SessionWorker;
