pub mod client;
pub mod stream;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level failures, split so callers can tell "server unreachable"
/// from "server replied nonsense".
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No process is running and no debug override is set.
    #[error("no sidecar endpoint is available")]
    NoEndpoint,

    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("server returned status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

/// Connectivity state published to UI-facing subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Pending,
    Disconnected,
    Error,
}

// ─── Wire types ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// One tool the server is willing to execute during chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: ToolFunction,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// Name of the built-in note-taking tool. Chat requests either pin the tool
/// list to exactly this tool or exclude it, depending on the caller.
pub const NOTE_TOOL: &str = "remember_how_to_use_tools";

pub fn filter_tools(tools: Vec<Tool>, take_note: bool) -> Vec<Tool> {
    tools
        .into_iter()
        .filter(|t| (t.function.name == NOTE_TOOL) == take_note)
        .collect()
}

/// Response of `POST /v1/at-command-completion`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandCompletionResponse {
    #[serde(default)]
    pub completions: Vec<String>,
    #[serde(default)]
    pub replace: Option<(i64, i64)>,
    #[serde(default)]
    pub is_cmd_executable: bool,
}

/// Response of `POST /v1/at-command-preview`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandPreviewResponse {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemPrompt {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub text: String,
}

/// Response of `GET /v1/customization`; only the prompt map is consumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CustomizationResponse {
    #[serde(default)]
    pub system_prompts: HashMap<String, SystemPrompt>,
}
