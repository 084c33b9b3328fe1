//! Fleet manager.
//!
//! Owns the adapter registry, keeps every tracker in step with the container
//! runtime and answers status queries for the whole fleet under one deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, RuntimeEvent, RuntimeEventKind};
use crate::service::{Service, ServiceError, ServiceRegistry, StatusContext};
use crate::setup::{SetupAgent, SetupState};

/// Extra time granted to status tasks past the deadline before they are aborted.
const COLLECT_GRACE: Duration = Duration::from_millis(100);

const EVENT_RETRY_MIN: Duration = Duration::from_secs(1);
const EVENT_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Duplicate service: {0}")]
    DuplicateService(String),
    #[error("Service not found: {0}")]
    ServiceNotFound(String),
    #[error("Failed to close {service}: {source}")]
    Close {
        service: String,
        #[source]
        source: ServiceError,
    },
}

pub struct FleetManager {
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    setup: Option<Arc<SetupAgent>>,
    api_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl FleetManager {
    pub fn new(
        services: Vec<Arc<dyn Service>>,
        runtime: Arc<dyn ContainerRuntime>,
        api_timeout: Duration,
    ) -> Result<Self, FleetError> {
        let registry = ServiceRegistry::new(services).map_err(FleetError::DuplicateService)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            registry: Arc::new(registry),
            runtime,
            setup: None,
            api_timeout,
            shutdown_tx,
            event_task: Mutex::new(None),
        })
    }

    pub fn with_setup_agent(mut self, setup: Arc<SetupAgent>) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn service(&self, name: &str) -> Result<&Arc<dyn Service>, FleetError> {
        self.registry
            .get(name)
            .ok_or_else(|| FleetError::ServiceNotFound(name.to_string()))
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<dyn Service>> {
        self.registry.iter()
    }

    pub fn api_timeout(&self) -> Duration {
        self.api_timeout
    }

    pub fn setup_state(&self) -> SetupState {
        self.setup.as_ref().map(|s| s.state()).unwrap_or_default()
    }

    /// Open upstream connections of enabled adapters and start following runtime events.
    pub fn start(self: &Arc<Self>) {
        for service in self.registry.iter() {
            if service.container().is_disabled() {
                debug!(service = %service.name(), "Disabled, not connecting");
                continue;
            }
            service.open();
        }

        let fleet = self.clone();
        let handle = tokio::spawn(async move { fleet.run_event_loop().await });
        *self.event_task.lock() = Some(handle);
        info!(services = self.registry.len(), "Fleet started");
    }

    /// Subscribe to runtime events, sync every tracker once, then apply
    /// events in order until shutdown. A failed or ended stream is
    /// resubscribed after a backoff, followed by a fresh sync.
    pub async fn run_event_loop(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = EVENT_RETRY_MIN;

        loop {
            // Events are replayed from this point, so nothing between the
            // sync and the stream becoming live is lost.
            let since = Utc::now().timestamp();
            let mut events = self.runtime.events(Some(since));
            self.sync_all().await;

            let mut delivered = false;
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            delivered = true;
                            self.handle_runtime_event(event).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Runtime event stream failed");
                            break;
                        }
                        None => {
                            warn!("Runtime event stream ended");
                            break;
                        }
                    },
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                        debug!("Event loop shutting down");
                        return;
                    }
                }
            }

            if delivered {
                backoff = EVENT_RETRY_MIN;
            }
            debug!(delay = ?backoff, "Resubscribing to runtime events");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            backoff = (backoff * 2).min(EVENT_RETRY_MAX);
        }
    }

    /// Inspect every tracked container once.
    pub async fn sync_all(&self) {
        let refreshes = self.registry.iter().map(|service| async move {
            if let Err(e) = service.container().refresh().await {
                warn!(service = %service.name(), error = %e, "Failed to inspect container");
            }
        });
        join_all(refreshes).await;
    }

    pub async fn handle_runtime_event(&self, event: RuntimeEvent) {
        if event.kind == RuntimeEventKind::Destroyed {
            let by_id = self.registry.iter().find(|service| {
                service.container().tracker().container_id().as_deref() == Some(event.container_id.as_str())
            });
            let target = by_id.or_else(|| {
                event
                    .name
                    .as_deref()
                    .and_then(|name| self.registry.by_container(name))
            });
            if let Some(service) = target {
                debug!(service = %service.name(), "Container destroyed");
                service.container().tracker().update(None);
            }
            return;
        }

        let name = match event.name {
            Some(name) => name,
            None => match self.runtime.inspect(&event.container_id).await {
                Ok(Some(record)) => record.name,
                Ok(None) => return,
                Err(e) => {
                    warn!(container_id = %event.container_id, error = %e, "Failed to resolve container");
                    return;
                }
            },
        };

        let Some(service) = self.registry.by_container(&name) else {
            debug!(container = %name, "Ignoring event for untracked container");
            return;
        };

        debug!(service = %service.name(), kind = ?event.kind, "Container event");
        if let Err(e) = service.container().refresh().await {
            warn!(service = %service.name(), error = %e, "Failed to inspect container");
        }
    }

    /// Status of every adapter by `deadline`. Always one entry per adapter.
    pub async fn collect_status(&self, deadline: Instant) -> BTreeMap<String, String> {
        let ctx = Arc::new(StatusContext::new(
            self.registry.clone(),
            deadline,
            self.setup_state(),
        ));

        let tasks: Vec<(String, JoinHandle<String>)> = self
            .registry
            .iter()
            .map(|service| {
                let service = service.clone();
                let ctx = ctx.clone();
                let name = service.name().to_string();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout_at(ctx.deadline(), service.status(&ctx)).await {
                        Ok(status) => status,
                        Err(_) => "Error: timeout".to_string(),
                    }
                });
                (name, handle)
            })
            .collect();

        let mut statuses = BTreeMap::new();
        for (name, mut handle) in tasks {
            let status = match tokio::time::timeout_at(deadline + COLLECT_GRACE, &mut handle).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => format!("Error: {}", panic_message(e)),
                Err(_) => {
                    handle.abort();
                    "Error: timeout".to_string()
                }
            };
            statuses.insert(name, status);
        }
        statuses
    }

    pub async fn status_all(&self) -> BTreeMap<String, String> {
        self.collect_status(Instant::now() + self.api_timeout).await
    }

    pub async fn status(&self, name: &str) -> Result<String, FleetError> {
        let service = self.service(name)?;
        let deadline = Instant::now() + self.api_timeout;
        let ctx = StatusContext::new(self.registry.clone(), deadline, self.setup_state());
        Ok(
            match tokio::time::timeout_at(deadline, service.status(&ctx)).await {
                Ok(status) => status,
                Err(_) => "Error: timeout".to_string(),
            },
        )
    }

    /// Stop the event loop and close every adapter, continuing past failures.
    pub async fn close(&self) -> Result<(), FleetError> {
        self.shutdown_tx.send_replace(true);
        let task = self.event_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Event loop task failed");
            }
        }

        let mut first_error = None;
        for service in self.registry.iter() {
            if let Err(e) = service.close().await {
                warn!(service = %service.name(), error = %e, "Failed to close service");
                first_error.get_or_insert(FleetError::Close {
                    service: service.name().to_string(),
                    source: e,
                });
            }
        }

        info!("Fleet closed");
        first_error.map_or(Ok(()), Err)
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
