//! # menusync Common Library
//!
//! Shared code for the menusync client crates:
//! - Error taxonomy (`Error`, `ErrorKind`)
//! - Configuration loading (compiled defaults, TOML, environment)
//! - Wire event decoding (`ChannelMessage`, `StageEvent`, `StagePayload`)
//! - Observer event bus (`EventBus`, `SessionUpdate`)
//! - Timestamp helpers

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use backend::Backend;
pub use error::{Error, ErrorKind, Result};
