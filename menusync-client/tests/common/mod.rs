//! Scripted fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use menusync_client::aggregator::AggregatorState;
use menusync_client::transport::{Artifact, EventChannel, MessageStream, PipelineTransport, SessionStore};
use menusync_common::config::{ClientConfig, StageTimeouts};
use menusync_common::{Backend, Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One step of a scripted connection
#[derive(Debug, Clone)]
pub enum Step {
    Msg(String),
    Wait(Duration),
    /// Transport error on the open stream
    Fail(String),
    /// Never send anything again
    Hang,
}

pub fn msg(raw: &str) -> Step {
    Step::Msg(raw.to_string())
}

/// Each connect takes the next script; with none left, connecting fails
#[derive(Default)]
pub struct ScriptedChannel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub connects: AtomicUsize,
    pub backends: Mutex<Vec<Backend>>,
}

impl ScriptedChannel {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventChannel for ScriptedChannel {
    async fn connect(&self, _session_id: &str, backend: Backend) -> Result<MessageStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.backends.lock().unwrap().push(backend);
        let Some(script) = self.scripts.lock().unwrap().pop_front() else {
            return Err(Error::Transport {
                stage: 0,
                message: "connection refused".into(),
            });
        };

        let stream = async_stream::stream! {
            for step in script {
                match step {
                    Step::Msg(raw) => yield Ok(raw),
                    Step::Wait(d) => tokio::time::sleep(d).await,
                    Step::Fail(message) => {
                        yield Err(Error::Transport { stage: 0, message });
                        return;
                    }
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        };
        Ok(stream.boxed())
    }
}

/// Records pongs and uploads; uploads to `failing_backend` are refused
#[derive(Default)]
pub struct FakeTransport {
    pub pongs: AtomicUsize,
    pub uploads: Mutex<Vec<(String, Backend)>>,
    pub failing_backend: Option<Backend>,
}

impl FakeTransport {
    pub fn pongs(&self) -> usize {
        self.pongs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineTransport for FakeTransport {
    async fn start_session(&self, artifact: &Artifact, backend: Backend) -> Result<String> {
        if self.failing_backend == Some(backend) {
            return Err(Error::Transport {
                stage: 0,
                message: format!("{} unavailable", backend),
            });
        }
        self.uploads
            .lock()
            .unwrap()
            .push((artifact.file_name.clone(), backend));
        Ok("session-from-upload".to_string())
    }

    async fn pong(&self, _session_id: &str) -> Result<()> {
        self.pongs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _backend: Backend) -> Result<Duration> {
        Ok(Duration::from_millis(1))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub states: Mutex<HashMap<(Backend, String), AggregatorState>>,
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_state(&self, backend: Backend, session_id: &str) -> Result<AggregatorState> {
        self.states
            .lock()
            .unwrap()
            .get(&(backend, session_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(session_id.to_string()))
    }

    async fn store_state(&self, backend: Backend, session_id: &str, state: &AggregatorState) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert((backend, session_id.to_string()), state.clone());
        Ok(())
    }
}

/// Config with short timers for tests
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        stage_timeouts: StageTimeouts::uniform(150),
        reconnect_attempts: 2,
        reconnect_delay_ms: 10,
        request_timeout_ms: 500,
        completion_grace_ms: 5_000,
        ..ClientConfig::default()
    }
}

/// Like [`fast_config`] but with idle budgets long enough that a hanging
/// channel never times out during a test
pub fn patient_config() -> ClientConfig {
    ClientConfig {
        stage_timeouts: StageTimeouts::uniform(10_000),
        ..fast_config()
    }
}

pub const TRANSLATED: &str = r#"{"stage":3,"status":"completed","translated_categories":{
    "Mains":[{"id":"m1","source_text":"ラーメン","english_name":"Ramen"},
             {"id":"m2","source_text":"餃子","english_name":"Gyoza"}],
    "Drinks":[{"id":"d1","source_text":"お茶","english_name":"Green Tea"}]}}"#;

pub const CHUNK_M1: &str = r#"{"stage":4,"status":"active","processing_category":"Mains",
    "chunk_result":{"category":"Mains","items":[{"id":"m1","description":"Pork broth noodles"}]}}"#;

pub const COMPLETED: &str = r#"{"stage":6,"status":"completed","message":"done"}"#;

/// Poll `check` until it holds or a second has passed
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
