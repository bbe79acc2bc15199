//! Transport seams
//!
//! The client talks to the pipeline service through three narrow traits so
//! the stream client, coordinator and session manager can be driven by
//! scripted fakes in tests:
//! - [`PipelineTransport`]: request/response calls (upload, pong, health)
//! - [`EventChannel`]: the server push channel for one session
//! - [`SessionStore`]: per-backend session state, used by migration
//!
//! [`HttpTransport`] implements all three over HTTP + server-sent events.

pub mod http;

pub use http::HttpTransport;

use crate::aggregator::AggregatorState;
use async_trait::async_trait;
use futures::stream::BoxStream;
use menusync_common::{Backend, Error, Result};
use std::path::Path;
use std::time::Duration;

/// Raw channel messages, one JSON document per item
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Uploaded menu image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read a file, guessing the content type from its extension
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Err(Error::InvalidInput(format!("{} is empty", path.display())));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "menu".to_string());
        let content_type = content_type_for(path).to_string();
        Ok(Self {
            file_name,
            content_type,
            bytes,
        })
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[async_trait]
pub trait PipelineTransport: Send + Sync {
    /// Upload an artifact and start a pipeline session; returns its id
    async fn start_session(&self, artifact: &Artifact, backend: Backend) -> Result<String>;

    /// Answer a channel ping
    async fn pong(&self, session_id: &str) -> Result<()>;

    /// Health probe; returns the round-trip latency
    async fn probe(&self, backend: Backend) -> Result<Duration>;
}

#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Open the push channel for `session_id` on `backend`
    async fn connect(&self, session_id: &str, backend: Backend) -> Result<MessageStream>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_state(&self, backend: Backend, session_id: &str) -> Result<AggregatorState>;

    async fn store_state(
        &self,
        backend: Backend,
        session_id: &str,
        state: &AggregatorState,
    ) -> Result<()>;
}
