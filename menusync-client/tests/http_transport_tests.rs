//! HTTP transport against an in-process mock pipeline server
//!
//! The mock speaks the same endpoints as the real service: multipart
//! upload, SSE progress stream, pong, health and session state copies.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use menusync_client::aggregator::{AggregatorState, ProgressAggregator};
use menusync_client::models::Session;
use menusync_client::transport::{Artifact, EventChannel, HttpTransport, PipelineTransport, SessionStore};
use menusync_client::{SessionManager, SessionOutcome};
use menusync_common::config::{ClientConfig, StageTimeouts};
use menusync_common::events::{decode_message, ChannelMessage};
use menusync_common::{Backend, Error};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockPipeline {
    pongs: AtomicUsize,
    uploads: Mutex<Vec<(String, usize)>>,
    states: Mutex<HashMap<(String, String), Value>>,
}

type Shared = Arc<MockPipeline>;

const SCRIPT: &[&str] = &[
    r#"{"type":"ping"}"#,
    r#"{"stage":1,"status":"completed","ocr_text":"ラーメン 800円"}"#,
    r#"{"type":"heartbeat"}"#,
    r#"{"stage":3,"status":"completed","translated_categories":{"Mains":[{"id":"m1","japanese_name":"ラーメン","english_name":"Ramen","price":"800"}]}}"#,
    r#"{"stage":4,"status":"active","processing_category":"Mains","chunk_result":[{"id":"m1","description":"Pork broth"}]}"#,
    r#"{"stage":4,"status":"active","category_completed":"Mains","completed_category_items":[{"id":"m1","english_name":"Ramen","description":"Pork broth noodles"}]}"#,
    r#"{"stage":5,"status":"completed","images_generated":{"Mains":[{"english_name":"Ramen","image_url":"https://img.example/ramen.png"}]}}"#,
    r#"{"stage":6,"status":"completed","message":"done"}"#,
];

async fn process(
    State(mock): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("multipart/form-data") {
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }
    let backend = query.get("backend").cloned().unwrap_or_default();
    mock.uploads.lock().unwrap().push((backend, body.len()));
    Ok(Json(json!({ "session_id": "sess-42" })))
}

async fn progress(Path(_id): Path<String>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        for raw in SCRIPT {
            tokio::time::sleep(Duration::from_millis(5)).await;
            yield Ok(Event::default().data(*raw));
        }
    };
    Sse::new(stream)
}

async fn pong(State(mock): State<Shared>, Path(_id): Path<String>) -> Json<Value> {
    mock.pongs.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "status": "pong_received" }))
}

async fn health(Query(query): Query<HashMap<String, String>>) -> StatusCode {
    match query.get("backend").map(String::as_str) {
        Some("durable") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

async fn load_state(
    State(mock): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let key = (query.get("backend").cloned().unwrap_or_default(), id);
    mock.states
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn store_state(
    State(mock): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(state): Json<Value>,
) -> StatusCode {
    let key = (query.get("backend").cloned().unwrap_or_default(), id);
    mock.states.lock().unwrap().insert(key, state);
    StatusCode::NO_CONTENT
}

async fn serve() -> (String, Shared) {
    let mock: Shared = Arc::default();
    let app = Router::new()
        .route("/api/v1/process", post(process))
        .route("/api/v1/progress/:id", get(progress))
        .route("/api/v1/pong/:id", post(pong))
        .route("/api/v1/health", get(health))
        .route("/api/v1/sessions/:id/state", get(load_state).put(store_state))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), mock)
}

fn config(base_url: String) -> ClientConfig {
    ClientConfig {
        base_url,
        stage_timeouts: StageTimeouts::uniform(2_000),
        reconnect_attempts: 1,
        reconnect_delay_ms: 10,
        request_timeout_ms: 2_000,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_event_stream_decodes_in_order() {
    let (base, _) = serve().await;
    let transport = HttpTransport::new(&config(base)).unwrap();

    let raw: Vec<String> = transport
        .connect("sess-42", Backend::Ephemeral)
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(raw.len(), SCRIPT.len());

    let decoded: Vec<ChannelMessage> = raw.iter().map(|r| decode_message(r).unwrap()).collect();
    assert_eq!(decoded[0], ChannelMessage::Ping);
    assert_eq!(decoded[2], ChannelMessage::Heartbeat);
    match &decoded[7] {
        ChannelMessage::Stage(event) => assert_eq!(event.stage, 6),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_pong_and_health() {
    let (base, mock) = serve().await;
    let transport = HttpTransport::new(&config(base)).unwrap();

    let artifact = Artifact::new("menu.png", "image/png", vec![1, 2, 3, 4]);
    let id = transport.start_session(&artifact, Backend::Durable).await.unwrap();
    assert_eq!(id, "sess-42");
    {
        let uploads = mock.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "durable");
        assert!(uploads[0].1 > 4, "multipart body wraps the file bytes");
    }

    transport.pong(&id).await.unwrap();
    assert_eq!(mock.pongs.load(Ordering::SeqCst), 1);

    assert!(transport.probe(Backend::Ephemeral).await.is_ok());
    assert!(matches!(
        transport.probe(Backend::Durable).await,
        Err(Error::Transport { .. })
    ));
}

#[tokio::test]
async fn test_session_state_copy() {
    let (base, _) = serve().await;
    let transport = HttpTransport::new(&config(base)).unwrap();

    let mut agg = ProgressAggregator::new(Session::new("sess-42", Backend::Ephemeral));
    let ChannelMessage::Stage(event) = decode_message(SCRIPT[3]).unwrap() else {
        panic!("not a stage event")
    };
    agg.apply(&event);
    let state = agg.state().clone();

    transport
        .store_state(Backend::Durable, "sess-42", &state)
        .await
        .unwrap();
    let loaded: AggregatorState = transport.load_state(Backend::Durable, "sess-42").await.unwrap();
    assert_eq!(loaded, state);

    assert!(matches!(
        transport.load_state(Backend::Ephemeral, "sess-42").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_end_to_end_session() {
    let (base, mock) = serve().await;
    let manager = SessionManager::http(config(base)).unwrap();

    let artifact = Artifact::new("menu.jpg", "image/jpeg", vec![0xff, 0xd8, 0xff]);
    let mut handle = manager.start(&artifact).await.unwrap();
    assert_eq!(handle.wait().await, SessionOutcome::Completed { degraded: false });

    let snapshot = handle.snapshot();
    let mains = snapshot.category("Mains").unwrap();
    assert_eq!(mains.items.len(), 1);
    let ramen = &mains.items[0];
    assert_eq!(ramen.item.display_name(), "Ramen");
    assert_eq!(ramen.item.description.as_deref(), Some("Pork broth noodles"));
    assert_eq!(ramen.item.image_url.as_deref(), Some("https://img.example/ramen.png"));
    assert!(ramen.flags.is_complete);

    for _ in 0..100 {
        if mock.pongs.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mock.pongs.load(Ordering::SeqCst), 1);
}
