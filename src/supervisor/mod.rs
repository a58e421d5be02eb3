//! Sidecar process supervision.
//!
//! `ProcessSupervisor` guarantees that at most one child process matching
//! the current desired configuration is running, and that every
//! configuration change is applied atomically with respect to concurrent
//! callers: all mutation goes through one async mutex. A debug override
//! port disables process management entirely and routes traffic to an
//! externally managed server.

pub mod error;
pub mod health;
pub mod process;

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::capabilities::CapabilityCache;
use crate::config::{
    AccountProvider, ProcessConfig, ReconfigureTrigger, ServerAddress, SettingsProvider,
};
use crate::protocol::client::ProtocolClient;
use crate::protocol::ProtocolError;

pub use error::SupervisorError;
pub use process::SupervisedProcess;

/// Retry and timing contract of the supervisor. The defaults are the
/// documented operator-facing values; tests shrink them.
#[derive(Debug, Clone)]
pub struct SupervisorTuning {
    /// Private loopback range the sidecar port is drawn from.
    pub port_range: RangeInclusive<u16>,
    pub launch_attempts: u32,
    /// Bounded wait after launch before the first probe.
    pub startup_wait: Duration,
    pub probe_attempts: u32,
    pub probe_backoff: Duration,
    /// Grace period for the `/v1/graceful-shutdown` path before force-kill.
    pub shutdown_grace: Duration,
    pub health_interval: Duration,
}

impl Default for SupervisorTuning {
    fn default() -> Self {
        Self {
            port_range: 32000..=32199,
            launch_attempts: 5,
            startup_wait: Duration::from_secs(5),
            probe_attempts: 5,
            probe_backoff: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(3),
            health_interval: Duration::from_secs(1),
        }
    }
}

fn draw_port(range: RangeInclusive<u16>) -> u16 {
    rand::thread_rng().gen_range(range)
}

/// Where protocol traffic should go right now.
///
/// Resolved at call time by the protocol client, so requests always track
/// the latest restart: the debug override wins, then the active process
/// port, else nothing.
pub struct SidecarEndpoint {
    settings: Arc<dyn SettingsProvider>,
    active_port: RwLock<Option<u16>>,
}

impl SidecarEndpoint {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        Self { settings, active_port: RwLock::new(None) }
    }

    pub fn base_url(&self) -> Option<Url> {
        let port = self.settings.settings().debug_port.or_else(|| {
            *self.active_port.read().unwrap_or_else(|e| e.into_inner())
        })?;
        Url::parse(&format!("http://127.0.0.1:{}/", port)).ok()
    }

    fn set_active_port(&self, port: u16) {
        *self.active_port.write().unwrap_or_else(|e| e.into_inner()) = Some(port);
    }

    fn clear_active_port(&self) {
        *self.active_port.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

struct SupervisorState {
    process: Option<SupervisedProcess>,
    /// Last applied configuration in pre-port-assignment form (port 0), so
    /// a freshly composed config diffs cleanly against it.
    last_config: Option<ProcessConfig>,
}

pub struct ProcessSupervisor {
    binary: PathBuf,
    client_version: String,
    settings: Arc<dyn SettingsProvider>,
    account: Arc<dyn AccountProvider>,
    endpoint: Arc<SidecarEndpoint>,
    client: Arc<ProtocolClient>,
    caps: Arc<CapabilityCache>,
    tuning: SupervisorTuning,
    /// The single mutual-exclusion point for spawn/terminate/reconfigure.
    state: tokio::sync::Mutex<SupervisorState>,
    working: AtomicBool,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Create the supervisor and start its health monitor. No process is
    /// spawned until the first [`reconfigure`](Self::reconfigure).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        binary: PathBuf,
        client_version: String,
        settings: Arc<dyn SettingsProvider>,
        account: Arc<dyn AccountProvider>,
        endpoint: Arc<SidecarEndpoint>,
        client: Arc<ProtocolClient>,
        caps: Arc<CapabilityCache>,
        tuning: SupervisorTuning,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            binary,
            client_version,
            settings,
            account,
            endpoint,
            client,
            caps,
            state: tokio::sync::Mutex::new(SupervisorState { process: None, last_config: None }),
            working: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
            tuning,
        });
        let task = health::spawn_health_loop(
            Arc::downgrade(&supervisor),
            supervisor.tuning.health_interval,
            supervisor.shutdown.clone(),
        );
        *supervisor.health_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        supervisor
    }

    /// Apply the current settings. Serialized: concurrent calls queue on the
    /// state mutex. With a debug override set, any owned process is torn
    /// down and nothing else happens; the override is the service address.
    pub async fn reconfigure(&self, trigger: ReconfigureTrigger) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        tracing::info!(?trigger, "applying sidecar configuration");
        if self.settings.settings().debug_port.is_some() {
            self.terminate_locked(&mut state).await;
            return Ok(());
        }
        self.spawn_locked(&mut state).await
    }

    /// True when a debug override is active, or the last spawn reached the
    /// working state and no failure has been observed since.
    pub fn is_working(&self) -> bool {
        self.settings.settings().debug_port.is_some() || self.working.load(Ordering::SeqCst)
    }

    pub fn base_url(&self) -> Option<Url> {
        self.endpoint.base_url()
    }

    pub async fn process_id(&self) -> Option<u32> {
        self.state.lock().await.process.as_ref().map(SupervisedProcess::pid)
    }

    pub async fn has_live_process(&self) -> bool {
        let mut state = self.state.lock().await;
        state.process.as_mut().is_some_and(SupervisedProcess::is_running)
    }

    /// Tear down the owned process, if any. Idempotent and infallible; also
    /// safe to call when nothing was ever spawned.
    pub async fn terminate(&self) {
        let mut state = self.state.lock().await;
        self.terminate_locked(&mut state).await;
    }

    /// Stop the health monitor and tear down the process. Call before drop;
    /// drop alone only cancels the background task (it cannot await).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.terminate().await;
    }

    pub(crate) async fn health_check(&self) -> Result<(), SupervisorError> {
        if self.settings.settings().debug_port.is_some() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        // Only respawn something we actually started and lost; an explicit
        // terminate or an unconfigured supervisor is left alone.
        if state.last_config.is_none() || state.process.is_none() {
            return Ok(());
        }
        if state.process.as_mut().is_some_and(SupervisedProcess::is_running) {
            return Ok(());
        }
        self.working.store(false, Ordering::SeqCst);
        tracing::warn!("sidecar process is gone, respawning");
        self.spawn_locked(&mut state).await
    }

    fn compose_config(&self) -> ProcessConfig {
        let settings = self.settings.settings();
        ProcessConfig {
            address: match settings.inference_url {
                Some(url) => ServerAddress::Custom(url),
                None => ServerAddress::Default,
            },
            api_key: self.account.api_key(),
            port: 0,
            client_version: self.client_version.clone(),
            telemetry: settings.telemetry_enabled,
            deployment: settings.deployment,
            ast: settings.ast_enabled,
            ast_file_limit: settings.ast_file_limit,
            vecdb: settings.vecdb_enabled,
        }
    }

    async fn spawn_locked(&self, state: &mut SupervisorState) -> Result<(), SupervisorError> {
        let desired = self.compose_config();
        let alive = state.process.as_mut().is_some_and(SupervisedProcess::is_running);
        if alive && state.last_config.as_ref() == Some(&desired) {
            tracing::debug!("configuration unchanged and process alive, nothing to do");
            return Ok(());
        }

        self.caps.reset();
        self.terminate_locked(state).await;

        if !desired.is_valid() {
            tracing::warn!("sidecar configuration has no resolvable address, staying down");
            return Ok(());
        }

        let mut attempt = 0u32;
        let mut process = loop {
            attempt += 1;
            let port = draw_port(self.tuning.port_range.clone());
            let config = desired.clone().with_port(port);
            // args carry the API key, so only the binary and port are logged
            tracing::info!(attempt, port, "launching sidecar: {}", self.binary.display());
            match SupervisedProcess::launch(&self.binary, config).await {
                Ok(process) => break process,
                Err(source) => {
                    tracing::warn!(attempt, error = %source, "sidecar launch failed");
                    if attempt >= self.tuning.launch_attempts {
                        return Err(SupervisorError::LaunchFailed { attempts: attempt, source });
                    }
                }
            }
        };

        let port = process.port();
        self.endpoint.set_active_port(port);
        // Give the server a moment to bind; an early exit in this window
        // surfaces as failed probes below.
        process.wait_exit(self.tuning.startup_wait).await;
        state.last_config = Some(desired);
        state.process = Some(process);

        let mut ready = false;
        for attempt in 1..=self.tuning.probe_attempts {
            match self.probe().await {
                Ok(()) => {
                    ready = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "sidecar startup probe failed");
                    if attempt < self.tuning.probe_attempts {
                        tokio::time::sleep(self.tuning.probe_backoff).await;
                    }
                }
            }
        }
        self.working.store(ready, Ordering::SeqCst);
        if ready {
            tracing::info!(port, "sidecar is up");
        } else {
            // Left running but not working; the health monitor takes over
            // if the process later dies.
            tracing::warn!(port, "sidecar did not become ready within the probe budget");
        }
        Ok(())
    }

    /// Liveness probe plus capability fetch; both must succeed before the
    /// process counts as working. Build info is informational only.
    async fn probe(&self) -> Result<(), ProtocolError> {
        self.client.ping().await?;
        match self.client.fetch_build_info().await {
            Ok(info) => tracing::debug!(build = %info.trim(), "sidecar build info"),
            Err(e) => tracing::debug!(error = %e, "build info fetch failed"),
        }
        self.caps.refresh_now().await?;
        Ok(())
    }

    async fn terminate_locked(&self, state: &mut SupervisorState) {
        self.working.store(false, Ordering::SeqCst);
        if let Some(mut process) = state.process.take() {
            let port = process.port();
            // Ask the server to wind down on its own port (the endpoint may
            // already point elsewhere); every failure here is swallowed.
            let _ = tokio::time::timeout(
                self.tuning.shutdown_grace,
                self.client.graceful_shutdown(port),
            )
            .await;
            if !process.wait_exit(self.tuning.shutdown_grace).await {
                process.force_kill().await;
            }
        }
        self.endpoint.clear_active_port();
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.health_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        // A still-running child is killed by its kill_on_drop handle; use
        // shutdown() for the graceful path.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityCache, CapabilityTuning};
    use crate::config::{SidecarSettings, StaticProviders};
    use crate::stats::UsageStats;

    fn build_supervisor(settings: SidecarSettings) -> Arc<ProcessSupervisor> {
        let providers = Arc::new(StaticProviders::new(settings, None));
        let endpoint = Arc::new(SidecarEndpoint::new(providers.clone()));
        let stats = Arc::new(UsageStats::new());
        let client = Arc::new(ProtocolClient::new(endpoint.clone(), providers.clone(), stats));
        let caps = CapabilityCache::new(client.clone(), CapabilityTuning::default());
        ProcessSupervisor::new(
            PathBuf::from("/nonexistent/sidecar-binary"),
            "test-0.0".to_string(),
            providers.clone(),
            providers,
            endpoint,
            client,
            caps,
            SupervisorTuning::default(),
        )
    }

    #[test]
    fn tuning_defaults_match_the_documented_contract() {
        let tuning = SupervisorTuning::default();
        assert_eq!(tuning.port_range, 32000..=32199);
        assert_eq!(tuning.launch_attempts, 5);
        assert_eq!(tuning.startup_wait, Duration::from_secs(5));
        assert_eq!(tuning.probe_attempts, 5);
        assert_eq!(tuning.probe_backoff, Duration::from_secs(3));
        assert_eq!(tuning.shutdown_grace, Duration::from_secs(3));
        assert_eq!(tuning.health_interval, Duration::from_secs(1));
    }

    #[test]
    fn drawn_ports_stay_in_range() {
        for _ in 0..200 {
            let port = draw_port(32000..=32199);
            assert!((32000..=32199).contains(&port));
        }
    }

    #[tokio::test]
    async fn terminate_without_process_is_a_noop() {
        let supervisor = build_supervisor(SidecarSettings::default());
        supervisor.terminate().await;
        supervisor.terminate().await;
        assert!(!supervisor.is_working());
        assert!(supervisor.base_url().is_none());
    }

    #[tokio::test]
    async fn debug_override_bypasses_process_management() {
        let settings = SidecarSettings { debug_port: Some(8123), ..SidecarSettings::default() };
        let supervisor = build_supervisor(settings);
        supervisor.reconfigure(ReconfigureTrigger::DebugPortChanged).await.unwrap();

        assert!(supervisor.is_working());
        assert_eq!(
            supervisor.base_url().unwrap().as_str(),
            "http://127.0.0.1:8123/"
        );
        assert!(supervisor.process_id().await.is_none());
    }

    #[tokio::test]
    async fn endpoint_resolution_order() {
        let providers =
            Arc::new(StaticProviders::new(SidecarSettings::default(), None));
        let endpoint = SidecarEndpoint::new(providers.clone());
        assert!(endpoint.base_url().is_none());

        endpoint.set_active_port(32042);
        assert_eq!(endpoint.base_url().unwrap().as_str(), "http://127.0.0.1:32042/");

        // the override wins over the active process port
        let mut settings = providers.settings();
        settings.debug_port = Some(9001);
        providers.update_settings(settings);
        assert_eq!(endpoint.base_url().unwrap().as_str(), "http://127.0.0.1:9001/");

        endpoint.clear_active_port();
        assert_eq!(endpoint.base_url().unwrap().as_str(), "http://127.0.0.1:9001/");
    }
}
