use std::sync::Arc;

use sidecar_core::{
    CapabilityCache, CapabilityTuning, DaemonConfig, ProcessSupervisor, ProtocolClient,
    ReconfigureTrigger, SidecarEndpoint, StaticProviders, SupervisorTuning, UsageStats,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    tracing::info!("sidecar daemon starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/sidecar.toml".to_string());
    let config = DaemonConfig::load(&config_path)?;

    let providers = Arc::new(StaticProviders::new(config.to_settings(), config.api_key.clone()));
    let endpoint = Arc::new(SidecarEndpoint::new(providers.clone()));
    let stats = Arc::new(UsageStats::new());
    let client = Arc::new(ProtocolClient::new(endpoint.clone(), providers.clone(), stats));
    let caps = CapabilityCache::new(client.clone(), CapabilityTuning::default());

    let supervisor = ProcessSupervisor::new(
        config.binary.clone(),
        format!("sidecar-core-{}", env!("CARGO_PKG_VERSION")),
        providers.clone(),
        providers,
        endpoint,
        client,
        caps.clone(),
        SupervisorTuning::default(),
    );

    if let Err(e) = supervisor.reconfigure(ReconfigureTrigger::Startup).await {
        tracing::error!("initial sidecar start failed: {}", e);
    }

    // Surface capability changes in the log so an operator can follow the
    // sidecar's startup without attaching a client.
    let mut events = caps.subscribe();
    tokio::spawn(async move {
        while let Ok(snapshot) = events.recv().await {
            if snapshot.is_known() {
                tracing::info!(
                    cloud = %snapshot.cloud_name,
                    chat_models = snapshot.chat_models.len(),
                    "capabilities changed"
                );
            } else {
                tracing::info!("capabilities cleared");
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received, stopping sidecar");
    caps.shutdown();
    supervisor.shutdown().await;
    tracing::info!("sidecar daemon stopped");
    Ok(())
}
