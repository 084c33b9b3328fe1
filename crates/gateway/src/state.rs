use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::attach::LauncherRegistry;
use crate::config::GatewayConfig;
use crate::fleet::FleetManager;
use crate::setup::SetupAgent;

/// Shared application state (thread-safe)
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub fleet: Arc<FleetManager>,
    pub launchers: Arc<LauncherRegistry>,
    pub setup: Option<Arc<SetupAgent>>,
    /// Flipped to `true` once on shutdown; background tasks watch it.
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        fleet: Arc<FleetManager>,
        setup: Option<Arc<SetupAgent>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            fleet,
            launchers: Arc::new(LauncherRegistry::new()),
            setup,
            shutdown_tx,
        }
    }

    /// Deadline for one upward call.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.fleet.api_timeout()
    }

    /// Stop background tasks and close every adapter.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.fleet.close().await {
            warn!(error = %e, "Fleet did not close cleanly");
        }
        info!("Gateway stopped");
    }
}
