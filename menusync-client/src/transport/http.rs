//! HTTP implementation of the transport traits
//!
//! Endpoints (relative to `{base_url}/api/{version}`):
//! - `POST /process?backend=`          multipart upload, returns `{session_id}`
//! - `GET  /progress/{id}?backend=`    server-sent events, one JSON message each
//! - `POST /pong/{id}`                 ping answer
//! - `GET  /health?backend=`           health probe
//! - `GET|PUT /sessions/{id}/state?backend=`  session state copy

use super::{Artifact, EventChannel, MessageStream, PipelineTransport, SessionStore};
use crate::aggregator::AggregatorState;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use menusync_common::config::ClientConfig;
use menusync_common::{Backend, Error, Result};
use reqwest::header::ACCEPT;
use reqwest::multipart;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("menusync/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP-level failures, folded into the common error on the way out
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<HttpError> for Error {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Api(404, body) => Error::NotFound(body),
            HttpError::Decode(msg) => Error::Parse(msg),
            other => Error::Transport {
                stage: 0,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    session_id: String,
}

pub struct HttpTransport {
    http_client: reqwest::Client,
    api_root: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // No client-wide timeout: the event stream stays open for minutes.
        // Request/response calls set their own.
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| HttpError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            api_root: config.api_root(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }

    async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, HttpError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HttpError::Api(status.as_u16(), body))
    }
}

#[async_trait]
impl PipelineTransport for HttpTransport {
    async fn start_session(&self, artifact: &Artifact, backend: Backend) -> Result<String> {
        let part = multipart::Part::bytes(artifact.bytes.clone())
            .file_name(artifact.file_name.clone())
            .mime_str(&artifact.content_type)
            .map_err(|e| Error::InvalidInput(format!("bad content type: {}", e)))?;
        let form = multipart::Form::new().part("file", part);
        let url = self.url("process");

        debug!(url = %url, backend = %backend, bytes = artifact.bytes.len(), "Uploading artifact");

        let response = self
            .http_client
            .post(&url)
            .query(&[("backend", backend.as_str())])
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        let response = Self::check(response).await?;
        let body: ProcessResponse = response
            .json()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))?;

        info!(session_id = %body.session_id, backend = %backend, "Pipeline session started");
        Ok(body.session_id)
    }

    async fn pong(&self, session_id: &str) -> Result<()> {
        let response = self
            .http_client
            .post(self.url(&format!("pong/{}", session_id)))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn probe(&self, backend: Backend) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .http_client
            .get(self.url("health"))
            .query(&[("backend", backend.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        Self::check(response).await?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl EventChannel for HttpTransport {
    async fn connect(&self, session_id: &str, backend: Backend) -> Result<MessageStream> {
        let url = self.url(&format!("progress/{}", session_id));
        debug!(url = %url, backend = %backend, "Opening event stream");

        let response = self
            .http_client
            .get(&url)
            .query(&[("backend", backend.as_str())])
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        let response = Self::check(response).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(Ok(event.data)),
                    Err(e) => Some(Err(Error::from(HttpError::Network(e.to_string())))),
                }
            });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl SessionStore for HttpTransport {
    async fn load_state(&self, backend: Backend, session_id: &str) -> Result<AggregatorState> {
        let response = self
            .http_client
            .get(self.url(&format!("sessions/{}/state", session_id)))
            .query(&[("backend", backend.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        let response = Self::check(response).await?;
        let state = response
            .json()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))?;
        Ok(state)
    }

    async fn store_state(
        &self,
        backend: Backend,
        session_id: &str,
        state: &AggregatorState,
    ) -> Result<()> {
        let response = self
            .http_client
            .put(self.url(&format!("sessions/{}/state", session_id)))
            .query(&[("backend", backend.as_str())])
            .timeout(self.request_timeout)
            .json(state)
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
