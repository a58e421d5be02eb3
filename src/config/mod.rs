//! Configuration for the supervised sidecar process.
//!
//! `ProcessConfig` is the immutable launch description the supervisor diffs
//! to decide whether a restart is needed. The surrounding application feeds
//! settings in through the read-only [`SettingsProvider`] / [`AccountProvider`]
//! traits; the daemon binary backs them with a TOML file ([`DaemonConfig`]).

use std::path::PathBuf;
use std::sync::RwLock;

use serde::Deserialize;
use url::Url;

/// Where the sidecar should route inference traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    /// Use the vendor's public cloud endpoint built into the binary.
    Default,
    /// A self-hosted or enterprise endpoint.
    Custom(Url),
}

impl ServerAddress {
    /// Value passed to the sidecar's `--address-url` flag.
    pub fn as_arg(&self) -> String {
        match self {
            Self::Default => "default".to_string(),
            Self::Custom(url) => url.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Cloud,
    SelfHosted,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::SelfHosted => write!(f, "self-hosted"),
        }
    }
}

/// Immutable description of one sidecar invocation.
///
/// Two configs are equal iff every field matches; the supervisor compares the
/// freshly composed config (port still 0) against the previously active one
/// to detect no-op reconfiguration. The port is assigned once at spawn time
/// via [`ProcessConfig::with_port`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub address: ServerAddress,
    pub api_key: Option<String>,
    /// Loopback port the sidecar binds; 0 until chosen.
    pub port: u16,
    /// Client identity string reported to the server (product-version/build).
    pub client_version: String,
    pub telemetry: bool,
    pub deployment: DeploymentMode,
    pub ast: bool,
    pub ast_file_limit: usize,
    pub vecdb: bool,
}

impl ProcessConfig {
    /// A config is launchable when it has somewhere to route traffic: either
    /// the explicit default cloud, or a custom URL with a real host.
    pub fn is_valid(&self) -> bool {
        match &self.address {
            ServerAddress::Default => true,
            ServerAddress::Custom(url) => url.host_str().is_some_and(|h| !h.is_empty()),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Command-line arguments for the sidecar binary.
    ///
    /// Flag names are an external contract with the binary and must stay
    /// stable across restarts within a session.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--address-url".to_string(),
            self.address.as_arg(),
            "--http-port".to_string(),
            self.port.to_string(),
            "--enduser-client-version".to_string(),
            self.client_version.clone(),
            "--deployment-mode".to_string(),
            self.deployment.to_string(),
        ];
        if let Some(key) = &self.api_key {
            args.push("--api-key".to_string());
            args.push(key.clone());
        }
        if self.telemetry {
            args.push("--basic-telemetry".to_string());
        }
        if self.ast {
            args.push("--ast".to_string());
            args.push("--ast-max-files".to_string());
            args.push(self.ast_file_limit.to_string());
        }
        if self.vecdb {
            args.push("--vecdb".to_string());
        }
        args
    }
}

/// Why the supervisor is being asked to reapply configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureTrigger {
    Startup,
    ApiKeyChanged,
    InferenceUrlChanged,
    AstFlagChanged,
    AstFileLimitChanged,
    VecdbFlagChanged,
    DebugPortChanged,
}

/// Snapshot of the user settings that shape a sidecar invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarSettings {
    /// `None` means the default public endpoint.
    pub inference_url: Option<Url>,
    /// When set, all traffic goes to `127.0.0.1:<port>` and the supervisor
    /// performs no process management at all.
    pub debug_port: Option<u16>,
    pub ast_enabled: bool,
    pub ast_file_limit: usize,
    pub vecdb_enabled: bool,
    pub telemetry_enabled: bool,
    pub deployment: DeploymentMode,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            inference_url: None,
            debug_port: None,
            ast_enabled: false,
            ast_file_limit: 15_000,
            vecdb_enabled: false,
            telemetry_enabled: true,
            deployment: DeploymentMode::Cloud,
        }
    }
}

/// Read-only view of the current settings, resolved at call time so that
/// edits made elsewhere in the host application are honored on the next
/// reconfigure without restarting anything.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> SidecarSettings;
}

/// Read-only view of the account state. The token is read per call, so a
/// rotation mid-session is picked up by the next request.
pub trait AccountProvider: Send + Sync {
    fn api_key(&self) -> Option<String>;
}

/// In-memory provider backing both traits. Used by the daemon binary after
/// loading [`DaemonConfig`], and by tests that flip settings mid-run.
pub struct StaticProviders {
    settings: RwLock<SidecarSettings>,
    api_key: RwLock<Option<String>>,
}

impl StaticProviders {
    pub fn new(settings: SidecarSettings, api_key: Option<String>) -> Self {
        Self {
            settings: RwLock::new(settings),
            api_key: RwLock::new(api_key),
        }
    }

    pub fn update_settings(&self, settings: SidecarSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn update_api_key(&self, key: Option<String>) {
        *self.api_key.write().unwrap_or_else(|e| e.into_inner()) = key;
    }
}

impl SettingsProvider for StaticProviders {
    fn settings(&self) -> SidecarSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AccountProvider for StaticProviders {
    fn api_key(&self) -> Option<String> {
        self.api_key.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ─── Daemon config file ──────────────────────────────────────

/// TOML configuration for the standalone daemon binary.
#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the sidecar executable.
    pub binary: PathBuf,
    pub inference_url: Option<Url>,
    pub api_key: Option<String>,
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub ast_enabled: bool,
    #[serde(default = "default_ast_file_limit")]
    pub ast_file_limit: usize,
    #[serde(default)]
    pub vecdb_enabled: bool,
    #[serde(default = "default_true")]
    pub telemetry_enabled: bool,
}

fn default_ast_file_limit() -> usize {
    15_000
}

fn default_true() -> bool {
    true
}

impl DaemonConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {}", path, e))?;
        Ok(toml::from_str(&s)?)
    }

    pub fn to_settings(&self) -> SidecarSettings {
        SidecarSettings {
            inference_url: self.inference_url.clone(),
            debug_port: self.debug_port,
            ast_enabled: self.ast_enabled,
            ast_file_limit: self.ast_file_limit,
            vecdb_enabled: self.vecdb_enabled,
            telemetry_enabled: self.telemetry_enabled,
            deployment: if self.inference_url.is_some() {
                DeploymentMode::SelfHosted
            } else {
                DeploymentMode::Cloud
            },
        }
    }
}
