//! HTTP client for the supervised server.
//!
//! The base URL is resolved per call from the endpoint, so requests always
//! follow process restarts and the debug override. Every call reads the
//! bearer token from the account provider at dispatch time, so a token
//! rotation mid-session is honored on the next request.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CommandCompletionResponse, CommandPreviewResponse, ConnectionStatus, CustomizationResponse,
    ProtocolError, SystemPrompt, Tool,
};
use crate::capabilities::Capabilities;
use crate::config::AccountProvider;
use crate::stats::UsageStats;
use crate::supervisor::SidecarEndpoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// One in-flight exchange. The caller owns it; cancelling drops the
/// transfer, which releases the underlying connection.
pub struct RequestHandle<T> {
    cancel: CancellationToken,
    task: JoinHandle<Result<T, ProtocolError>>,
}

impl<T> RequestHandle<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<T, ProtocolError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ProtocolError::Cancelled),
            Err(e) => Err(ProtocolError::Internal(format!("request task failed: {e}"))),
        }
    }
}

/// Connectivity state shared with dispatched request tasks.
pub(super) struct StatusCell {
    current: RwLock<ConnectionStatus>,
    last_error: RwLock<Option<String>>,
    events: broadcast::Sender<ConnectionStatus>,
}

impl StatusCell {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(ConnectionStatus::Pending),
            last_error: RwLock::new(None),
            events,
        }
    }

    pub(super) fn publish(&self, status: ConnectionStatus, error: Option<String>) {
        if let Some(message) = error {
            *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = Some(message);
        }
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if *current == status {
            return;
        }
        *current = status;
        drop(current);
        let _ = self.events.send(status);
    }
}

pub struct ProtocolClient {
    http: reqwest::Client,
    endpoint: Arc<SidecarEndpoint>,
    account: Arc<dyn AccountProvider>,
    pub(super) stats: Arc<UsageStats>,
    pub(super) status: Arc<StatusCell>,
}

impl ProtocolClient {
    pub fn new(
        endpoint: Arc<SidecarEndpoint>,
        account: Arc<dyn AccountProvider>,
        stats: Arc<UsageStats>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            account,
            stats,
            status: Arc::new(StatusCell::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.current.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.last_error.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.events.subscribe()
    }

    /// GET `path` relative to the current base URL.
    pub fn get(&self, path: &str, headers: Vec<(String, String)>) -> RequestHandle<String> {
        self.dispatch(reqwest::Method::GET, path, None, headers)
    }

    /// POST a JSON body to `path` relative to the current base URL.
    pub fn post(
        &self,
        path: &str,
        body: serde_json::Value,
        headers: Vec<(String, String)>,
    ) -> RequestHandle<String> {
        self.dispatch(reqwest::Method::POST, path, Some(body), headers)
    }

    fn dispatch(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        headers: Vec<(String, String)>,
    ) -> RequestHandle<String> {
        let cancel = CancellationToken::new();
        let resolved = self.url_for(path);
        let scope = scope_of(path);
        let http = self.http.clone();
        let api_key = self.account.api_key();
        let stats = self.stats.clone();
        let status = self.status.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let url = match resolved {
                Ok(url) => url,
                Err(e) => {
                    status.publish(ConnectionStatus::Disconnected, None);
                    return Err(e);
                }
            };
            let url_str = url.to_string();

            let mut request = http.request(method, url).timeout(REQUEST_TIMEOUT);
            if let Some(key) = api_key {
                request = request.bearer_auth(key);
            }
            for (name, value) in headers {
                request = request.header(&name, &value);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            let transfer = async {
                let response = request.send().await.map_err(|e| ProtocolError::Transport {
                    url: url_str.clone(),
                    message: e.to_string(),
                })?;
                let http_status = response.status();
                let text = response.text().await.map_err(|e| ProtocolError::Transport {
                    url: url_str.clone(),
                    message: e.to_string(),
                })?;
                if !http_status.is_success() {
                    return Err(ProtocolError::Status {
                        status: http_status.as_u16(),
                        url: url_str.clone(),
                        body: text,
                    });
                }
                Ok(text)
            };

            // Dropping the transfer future on cancellation aborts the
            // request and releases the connection.
            let outcome = tokio::select! {
                result = transfer => result,
                _ = token.cancelled() => Err(ProtocolError::Cancelled),
            };

            match &outcome {
                Ok(_) => {
                    stats.record_success(&scope);
                    status.publish(ConnectionStatus::Connected, None);
                }
                Err(ProtocolError::Transport { message, .. }) => {
                    stats.record_failure(&scope, &url_str, message);
                    status.publish(ConnectionStatus::Error, Some(message.clone()));
                }
                Err(ProtocolError::Status { status: code, .. }) => {
                    stats.record_failure(&scope, &url_str, &format!("status {code}"));
                    // the server answered, so transport-wise we are connected
                    status.publish(ConnectionStatus::Connected, None);
                }
                Err(_) => {}
            }
            outcome
        });

        RequestHandle { cancel, task }
    }

    pub(super) fn url_for(&self, path: &str) -> Result<Url, ProtocolError> {
        let base = self.endpoint.base_url().ok_or(ProtocolError::NoEndpoint)?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| ProtocolError::Internal(format!("invalid request path '{path}': {e}")))
    }

    pub(super) fn api_key(&self) -> Option<String> {
        self.account.api_key()
    }

    pub(super) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Liveness probe: any HTTP response from the base URL proves the
    /// server is up, whatever the status code.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        let url = self.url_for("/")?;
        let url_str = url.to_string();
        match self.http.get(url).timeout(PING_TIMEOUT).send().await {
            Ok(_) => Ok(()),
            Err(e) => Err(ProtocolError::Transport { url: url_str, message: e.to_string() }),
        }
    }

    /// Best-effort shutdown request against an explicit port, used during
    /// terminate when the endpoint may already point elsewhere.
    pub async fn graceful_shutdown(&self, port: u16) {
        let url = format!("http://127.0.0.1:{port}/v1/graceful-shutdown");
        match self.http.get(&url).timeout(PING_TIMEOUT).send().await {
            Ok(_) => tracing::debug!(port, "graceful shutdown requested"),
            Err(e) => tracing::debug!(port, error = %e, "graceful shutdown request failed"),
        }
    }

    // ─── Typed fetchers ──────────────────────────────────────

    pub async fn fetch_caps(&self) -> Result<Capabilities, ProtocolError> {
        self.get_json("/v1/caps").await
    }

    pub async fn fetch_build_info(&self) -> Result<String, ProtocolError> {
        self.get("/build_info", Vec::new()).wait().await
    }

    pub async fn fetch_available_tools(&self) -> Result<Vec<Tool>, ProtocolError> {
        self.get_json("/v1/at-tools-available").await
    }

    pub async fn fetch_command_completion(
        &self,
        query: &str,
        cursor: i64,
        top_n: usize,
    ) -> Result<CommandCompletionResponse, ProtocolError> {
        let body = serde_json::json!({ "query": query, "cursor": cursor, "top_n": top_n });
        self.post_json("/v1/at-command-completion", body).await
    }

    pub async fn fetch_command_preview(
        &self,
        query: &str,
    ) -> Result<CommandPreviewResponse, ProtocolError> {
        let body = serde_json::json!({ "query": query });
        self.post_json("/v1/at-command-preview", body).await
    }

    pub async fn fetch_system_prompts(
        &self,
    ) -> Result<HashMap<String, SystemPrompt>, ProtocolError> {
        let response: CustomizationResponse = self.get_json("/v1/customization").await?;
        Ok(response.system_prompts)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProtocolError> {
        let body = self.get(path, Vec::new()).wait().await?;
        decode(path, &body)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ProtocolError> {
        let text = self.post(path, body, Vec::new()).wait().await?;
        decode(path, &text)
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(body).map_err(|e| ProtocolError::Decode {
        url: path.to_string(),
        message: e.to_string(),
    })
}

fn scope_of(path: &str) -> String {
    path.trim_start_matches('/').trim_start_matches("v1/").to_string()
}
