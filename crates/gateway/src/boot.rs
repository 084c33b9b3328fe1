//! Boot: logging init, config load, Docker connection, fleet start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{GatewayConfig, LogFormat, LoggingConfig};
use crate::docker::client::DockerClient;
use crate::fleet::FleetManager;
use crate::runtime::ContainerRuntime;
use crate::service::factory::ServiceFactory;
use crate::setup::SetupAgent;
use crate::state::AppState;

/// Initialise the tracing subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Load config, connect to Docker, build the adapters and start the fleet.
pub async fn boot() -> Result<AppState> {
    let config = GatewayConfig::load().context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %config.network,
        "Starting dexgate"
    );

    info!(socket = %config.docker_socket, "Connecting to Docker daemon");
    let docker = DockerClient::new(&config.docker_socket).context("Failed to create Docker client")?;
    docker.ping().await.context("Docker daemon is not reachable")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let services = ServiceFactory::new(&config, runtime.clone())
        .build_all()
        .context("Failed to build service adapters")?;
    let mut fleet = FleetManager::new(
        services,
        runtime,
        Duration::from_secs(config.api_timeout_secs),
    )
    .context("Failed to build fleet")?;

    let setup = config
        .launcher_log
        .as_ref()
        .map(|path| Arc::new(SetupAgent::new(path)));
    if let Some(agent) = &setup {
        fleet = fleet.with_setup_agent(agent.clone());
    }

    let fleet = Arc::new(fleet);
    let state = AppState::new(config, fleet.clone(), setup);

    if let Some(agent) = state.setup.clone() {
        let shutdown = state.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = agent.run(shutdown).await {
                warn!(error = %e, "Setup agent stopped");
            }
        });
    }

    fleet.start();
    Ok(state)
}
