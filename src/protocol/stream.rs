//! Streaming chat exchanges.
//!
//! The server answers `POST /v1/chat` with server-sent events; each `data:`
//! line carries one JSON delta, `data: [DONE]` terminates the stream, and a
//! JSON object with a `detail` field is the server's structured error
//! payload. Chunks are handed to the caller through callbacks tagged with
//! the caller-supplied request id, so several streams can run and be
//! cancelled independently.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::ProtocolClient;
use super::{filter_tools, ChatMessage, ConnectionStatus, ProtocolError};
use crate::stats::UsageStats;

/// One chat call. `id` correlates every callback of this exchange.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub only_deterministic_messages: bool,
    /// Restrict the tool list to the note-taking tool.
    pub take_note: bool,
    pub max_new_tokens: u32,
}

impl ChatRequest {
    pub fn new(id: impl Into<String>, messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages,
            model: model.into(),
            only_deterministic_messages: false,
            take_note: false,
            max_new_tokens: 1000,
        }
    }
}

/// Callbacks for one streaming exchange. Exactly one of `on_stream_end`,
/// `on_error_chunk` or `on_stream_failed` fires last; a cancelled stream
/// fires none of them and delivers no further chunks.
pub struct ChatHandlers {
    pub on_chunk: Box<dyn Fn(&str, &str) + Send + Sync>,
    pub on_stream_end: Box<dyn Fn(&str) + Send + Sync>,
    pub on_error_chunk: Box<dyn Fn(&str, serde_json::Value) + Send + Sync>,
    pub on_stream_failed: Box<dyn Fn(&str, ProtocolError) + Send + Sync>,
}

/// Caller-owned handle for one live stream.
pub struct StreamHandle {
    request_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Stop the stream: the connection is dropped and no further callbacks
    /// fire. Cancellation is not an error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until delivery has finished (normally, with an error, or after
    /// cancellation).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl ProtocolClient {
    /// Start a streaming chat exchange.
    ///
    /// The request body mirrors what the server expects: the message list,
    /// the target model, generation parameters, the filtered tool list and
    /// the `stream: true` marker. Errors while connecting are returned
    /// directly; once the stream is live everything flows through the
    /// handlers.
    pub async fn send_chat(
        &self,
        request: ChatRequest,
        handlers: ChatHandlers,
    ) -> Result<StreamHandle, ProtocolError> {
        let url = self.url_for("/v1/chat")?;
        let url_str = url.to_string();

        let tools = filter_tools(self.fetch_available_tools().await?, request.take_note);
        let body = serde_json::json!({
            "messages": request.messages,
            "model": request.model,
            "parameters": { "max_new_tokens": request.max_new_tokens },
            "stream": true,
            "tools": tools,
            "only_deterministic_messages": request.only_deterministic_messages,
            "chat_id": request.id,
        });

        let mut builder = self.http().post(url).json(&body);
        if let Some(key) = self.api_key() {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            let err = ProtocolError::Transport { url: url_str.clone(), message: e.to_string() };
            self.stats.record_failure("chat", &url_str, &e.to_string());
            self.status.publish(ConnectionStatus::Error, Some(e.to_string()));
            err
        })?;

        let http_status = response.status();
        if !http_status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            self.stats.record_failure("chat", &url_str, &format!("status {http_status}"));
            return Err(ProtocolError::Status {
                status: http_status.as_u16(),
                url: url_str,
                body: body_text,
            });
        }

        self.status.publish(ConnectionStatus::Connected, None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_stream(
            response,
            request.id.clone(),
            handlers,
            cancel.clone(),
            self.stats.clone(),
        ));
        Ok(StreamHandle { request_id: request.id, cancel, task })
    }
}

async fn run_stream(
    response: reqwest::Response,
    id: String,
    handlers: ChatHandlers,
    cancel: CancellationToken,
    stats: Arc<UsageStats>,
) {
    let url = response.url().to_string();
    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(id = %id, "chat stream cancelled");
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for event in parser.push(&bytes) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match event {
                        SseEvent::Done => {
                            stats.record_success("chat");
                            (handlers.on_stream_end)(&id);
                            return;
                        }
                        SseEvent::Data(payload) => match classify_chunk(&payload) {
                            ChunkKind::Delta(raw) => (handlers.on_chunk)(&id, &raw),
                            ChunkKind::ErrorPayload(value) => {
                                tracing::warn!(id = %id, "server reported a chat error");
                                stats.record_failure("chat", &url, "server error payload");
                                (handlers.on_error_chunk)(&id, value);
                                return;
                            }
                        },
                    }
                }
            }
            Some(Err(e)) => {
                stats.record_failure("chat", &url, &e.to_string());
                (handlers.on_stream_failed)(
                    &id,
                    ProtocolError::Transport { url, message: e.to_string() },
                );
                return;
            }
            // EOF without a terminator still counts as a normal end.
            None => {
                stats.record_success("chat");
                (handlers.on_stream_end)(&id);
                return;
            }
        }
    }
}

// ─── SSE parsing ─────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Incremental line-oriented SSE reader; bytes may arrive split anywhere.
#[derive(Default)]
struct SseParser {
    buf: String,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else { continue };
            let payload = payload.trim();
            if payload == "[DONE]" {
                events.push(SseEvent::Done);
            } else {
                events.push(SseEvent::Data(payload.to_string()));
            }
        }
        events
    }
}

enum ChunkKind {
    Delta(String),
    ErrorPayload(serde_json::Value),
}

/// An object with a `detail` field is the server's error payload
/// convention; everything else is passed through raw.
fn classify_chunk(payload: &str) -> ChunkKind {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if value.get("detail").is_some() {
            return ChunkKind::ErrorPayload(value);
        }
    }
    ChunkKind::Delta(payload.to_string())
}
