//! Shared fixtures: an in-process fake sidecar server plus stack wiring.
#![allow(dead_code)]

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use sidecar_core::{
    CapabilityCache, CapabilityTuning, ProcessSupervisor, ProtocolClient, SidecarEndpoint,
    SidecarSettings, StaticProviders, SupervisorTuning, UsageStats,
};

/// Observable state of the fake sidecar.
#[derive(Default)]
pub struct FakeState {
    pub caps_hits: AtomicUsize,
    pub shutdown_hits: AtomicUsize,
    pub chat_bodies: Mutex<Vec<Value>>,
    pub chat_auth: Mutex<Vec<Option<String>>>,
}

/// Bind the fake sidecar on an ephemeral loopback port and serve it for the
/// rest of the test.
pub async fn start_fake_sidecar() -> (u16, Arc<FakeState>) {
    let state = Arc::new(FakeState::default());
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (port, state)
}

fn router(state: Arc<FakeState>) -> Router {
    Router::new()
        .route("/", get(|| async { "sidecar" }))
        .route("/build_info", get(|| async { "build 20240801" }))
        .route("/v1/caps", get(caps))
        .route("/v1/at-tools-available", get(tools))
        .route("/v1/at-command-completion", post(command_completion))
        .route("/v1/at-command-preview", post(command_preview))
        .route("/v1/customization", get(customization))
        .route("/v1/chat", post(chat))
        .route("/v1/graceful-shutdown", get(graceful_shutdown))
        .with_state(state)
}

async fn caps(State(state): State<Arc<FakeState>>) -> Json<Value> {
    state.caps_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "cloud_name": "fake-cloud",
        "chat_models": ["m1", "err-model", "slow-model"],
        "chat_default_model": "m1",
        "completion_models": ["c1"],
        "completion_default_model": "c1",
    }))
}

async fn tools() -> Json<Value> {
    Json(json!([
        { "type": "function", "function": { "name": "search", "description": "", "parameters": {} } },
        { "type": "function", "function": { "name": "remember_how_to_use_tools", "description": "", "parameters": {} } },
    ]))
}

async fn command_completion(Json(body): Json<Value>) -> Json<Value> {
    let query = body["query"].as_str().unwrap_or_default();
    Json(json!({
        "completions": ["@file", "@definition"],
        "replace": [0, query.len()],
        "is_cmd_executable": false,
    }))
}

async fn command_preview(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "messages": [{ "role": "context_file", "content": body["query"] }],
    }))
}

async fn customization() -> Json<Value> {
    Json(json!({
        "system_prompts": {
            "default": { "description": "plain", "text": "You are a code assistant." }
        }
    }))
}

async fn graceful_shutdown(State(state): State<Arc<FakeState>>) -> &'static str {
    state.shutdown_hits.fetch_add(1, Ordering::SeqCst);
    "ok"
}

/// Streams depend on the requested model:
/// - `m1`: three deltas, then `[DONE]`
/// - `err-model`: one delta, then a `detail` error payload
/// - `slow-model`: a long, slow stream (for cancellation tests)
async fn chat(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.chat_auth.lock().unwrap().push(auth);
    let model = body["model"].as_str().unwrap_or_default().to_string();
    state.chat_bodies.lock().unwrap().push(body);

    match model.as_str() {
        "err-model" => sse(vec![
            Event::default().data(r#"{"choices":[{"delta":{"content":"partial"}}]}"#),
            Event::default().data(r#"{"detail":"model exploded"}"#),
        ])
        .into_response(),
        "slow-model" => {
            let stream = futures_util::stream::unfold(0u32, |i| async move {
                if i >= 100 {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                let event = Event::default()
                    .data(format!(r#"{{"choices":[{{"delta":{{"content":"chunk{i}"}}}}]}}"#));
                Some((Ok::<_, Infallible>(event), i + 1))
            });
            Sse::new(stream).into_response()
        }
        _ => sse(vec![
            Event::default().data(r#"{"choices":[{"delta":{"content":"hel"}}]}"#),
            Event::default().data(r#"{"choices":[{"delta":{"content":"lo "}}]}"#),
            Event::default().data(r#"{"choices":[{"delta":{"content":"there"}}]}"#),
            Event::default().data("[DONE]"),
        ])
        .into_response(),
    }
}

fn sse(events: Vec<Event>) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    Sse::new(futures_util::stream::iter(events.into_iter().map(Ok)))
}

// ─── Stack wiring ────────────────────────────────────────────

pub struct Stack {
    pub providers: Arc<StaticProviders>,
    pub endpoint: Arc<SidecarEndpoint>,
    pub stats: Arc<UsageStats>,
    pub client: Arc<ProtocolClient>,
    pub caps: Arc<CapabilityCache>,
}

pub fn build_stack(settings: SidecarSettings, api_key: Option<String>) -> Stack {
    build_stack_with_caps(settings, api_key, CapabilityTuning::default())
}

pub fn build_stack_with_caps(
    settings: SidecarSettings,
    api_key: Option<String>,
    caps_tuning: CapabilityTuning,
) -> Stack {
    let providers = Arc::new(StaticProviders::new(settings, api_key));
    let endpoint = Arc::new(SidecarEndpoint::new(providers.clone()));
    let stats = Arc::new(UsageStats::new());
    let client = Arc::new(ProtocolClient::new(
        endpoint.clone(),
        providers.clone(),
        stats.clone(),
    ));
    let caps = CapabilityCache::new(client.clone(), caps_tuning);
    Stack { providers, endpoint, stats, client, caps }
}

pub fn build_supervisor(
    stack: &Stack,
    binary: PathBuf,
    tuning: SupervisorTuning,
) -> Arc<ProcessSupervisor> {
    ProcessSupervisor::new(
        binary,
        "test-harness-0.1".to_string(),
        stack.providers.clone(),
        stack.providers.clone(),
        stack.endpoint.clone(),
        stack.client.clone(),
        stack.caps.clone(),
        tuning,
    )
}

/// Tight timings so process-lifecycle tests finish quickly.
pub fn fast_tuning(port: u16) -> SupervisorTuning {
    SupervisorTuning {
        port_range: port..=port,
        launch_attempts: 3,
        startup_wait: Duration::from_millis(50),
        probe_attempts: 2,
        probe_backoff: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(150),
        health_interval: Duration::from_millis(100),
    }
}

/// Settings pointing every request at the fake sidecar via debug override.
pub fn override_settings(port: u16) -> SidecarSettings {
    SidecarSettings { debug_port: Some(port), ..SidecarSettings::default() }
}
