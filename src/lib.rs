pub mod capabilities;
pub mod config;
pub mod protocol;
pub mod stats;
pub mod supervisor;

pub use capabilities::{Capabilities, CapabilityCache, CapabilityTuning};
pub use config::{
    AccountProvider, DaemonConfig, DeploymentMode, ProcessConfig, ReconfigureTrigger,
    ServerAddress, SettingsProvider, SidecarSettings, StaticProviders,
};
pub use protocol::client::{ProtocolClient, RequestHandle};
pub use protocol::stream::{ChatHandlers, ChatRequest, StreamHandle};
pub use protocol::{ChatMessage, ConnectionStatus, ProtocolError, Tool};
pub use stats::UsageStats;
pub use supervisor::{ProcessSupervisor, SidecarEndpoint, SupervisorError, SupervisorTuning};
