//! Capability snapshots and the background poller that keeps them fresh.
//!
//! The cache polls `/v1/caps` on a fast cadence until the server reports a
//! real capability set (its own startup can lag the process start), then
//! drops to a slow cadence for the rest of the session. Snapshots are
//! replaced wholesale and every genuine change is announced on a broadcast
//! channel; identical polls are not re-announced.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::client::ProtocolClient;
use crate::protocol::ProtocolError;

/// What the running server currently supports. Immutable value; the cache
/// swaps whole instances so readers never observe a half-updated set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub cloud_name: String,
    #[serde(default)]
    pub chat_models: Vec<String>,
    #[serde(default)]
    pub chat_default_model: String,
    #[serde(default)]
    pub completion_models: Vec<String>,
    #[serde(default)]
    pub completion_default_model: String,
}

impl Capabilities {
    /// The server reports a cloud name once it has finished its own startup;
    /// before that, polls return an empty shell.
    pub fn is_known(&self) -> bool {
        !self.cloud_name.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityTuning {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
}

impl Default for CapabilityTuning {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(3),
            slow_interval: Duration::from_secs(15 * 60),
        }
    }
}

pub struct CapabilityCache {
    client: Arc<ProtocolClient>,
    tuning: CapabilityTuning,
    current: RwLock<Arc<Capabilities>>,
    events: broadcast::Sender<Arc<Capabilities>>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityCache {
    /// Create the cache and start polling immediately.
    pub fn new(client: Arc<ProtocolClient>, tuning: CapabilityTuning) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        let cache = Arc::new(Self {
            client,
            tuning,
            current: RwLock::new(Arc::new(Capabilities::default())),
            events,
            cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
        });
        let task = tokio::spawn(poll_loop(Arc::downgrade(&cache), cache.cancel.clone()));
        *cache.poll_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        cache
    }

    /// Last known snapshot; the empty default before the first success.
    pub fn current(&self) -> Arc<Capabilities> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Change notifications. Each received value is the full new snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Capabilities>> {
        self.events.subscribe()
    }

    /// Fetch a fresh snapshot on demand, bypassing the cadence. The result
    /// is installed (and announced if it differs) like any poll result.
    pub async fn refresh_now(&self) -> Result<Arc<Capabilities>, ProtocolError> {
        let caps = self.client.fetch_caps().await?;
        Ok(self.install(caps))
    }

    /// Forget the snapshot, announcing the empty set if anything was known.
    /// Called at the start of every spawn cycle.
    pub fn reset(&self) {
        self.install(Capabilities::default());
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn install(&self, caps: Capabilities) -> Arc<Capabilities> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if **current == caps {
            return current.clone();
        }
        let fresh = Arc::new(caps);
        *current = fresh.clone();
        drop(current);
        // No receivers is fine; subscribers come and go.
        let _ = self.events.send(fresh.clone());
        fresh
    }
}

impl Drop for CapabilityCache {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.poll_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn poll_loop(cache: Weak<CapabilityCache>, cancel: CancellationToken) {
    let mut period = match cache.upgrade() {
        Some(cache) => cache.tuning.fast_interval,
        None => return,
    };
    let mut settled = false;
    loop {
        {
            let Some(cache) = cache.upgrade() else { return };
            // Failures leave the previous snapshot in place and never stop
            // the schedule; the server may simply not be up yet.
            if let Err(e) = cache.refresh_now().await {
                tracing::debug!(error = %e, "capability poll failed");
            }
            if !settled && cache.current().is_known() {
                settled = true;
                period = cache.tuning.slow_interval;
                tracing::debug!("capabilities resolved, slowing poll cadence");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.cancelled() => return,
        }
    }
}
