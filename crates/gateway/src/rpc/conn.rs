//! Resilient connection: one self-healing link to an upstream.
//!
//! A background loop dials the target, publishes the client, waits for the
//! link to break and dials again, forever, until the connection is closed.
//! Readers take the published client with [`ResilientConnection::current_client`]
//! and never wait: `None` means "not connected right now".

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ConnectError;
use crate::runtime::BoxFuture;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How to dial one kind of upstream.
pub trait Connect: Send + Sync + 'static {
    type Target: Clone + fmt::Display + Send + Sync + 'static;
    type Client: Clone + Send + Sync + 'static;

    fn connect<'a>(
        &'a self,
        target: &'a Self::Target,
    ) -> BoxFuture<'a, Result<Self::Client, ConnectError>>;

    /// Resolves when the link behind `client` is gone. Transports that heal
    /// themselves underneath (tonic channels) never resolve.
    fn closed<'a>(&'a self, _client: &'a Self::Client) -> BoxFuture<'a, ()> {
        Box::pin(std::future::pending())
    }
}

struct Published<C> {
    client: RwLock<Option<C>>,
    generation: AtomicU64,
}

impl<C: Clone> Published<C> {
    fn publish(&self, client: C) -> u64 {
        let mut slot = self.client.write();
        *slot = Some(client);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn clear(&self) {
        *self.client.write() = None;
    }
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ResilientConnection<K: Connect> {
    name: String,
    connector: Arc<K>,
    target: Mutex<K::Target>,
    published: Arc<Published<K::Client>>,
    // Dropping the worker drops its shutdown sender, which stops the loop.
    worker: Mutex<Option<Worker>>,
    retry_delay: Duration,
}

impl<K: Connect> ResilientConnection<K> {
    pub fn new(name: impl Into<String>, connector: K, target: K::Target) -> Self {
        Self {
            name: name.into(),
            connector: Arc::new(connector),
            target: Mutex::new(target),
            published: Arc::new(Published {
                client: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> K::Target {
        self.target.lock().clone()
    }

    /// Start the connection loop. Calling it while a loop runs is a no-op.
    pub fn open(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.name.clone(),
            self.connector.clone(),
            self.target(),
            self.published.clone(),
            self.retry_delay,
            shutdown_rx,
        ));
        *worker = Some(Worker {
            shutdown_tx,
            handle,
        });
    }

    /// The published client, if a link is up. Never blocks on connecting.
    pub fn current_client(&self) -> Option<K::Client> {
        self.published.client.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.published.client.read().is_some()
    }

    /// Number of links published so far.
    pub fn generation(&self) -> u64 {
        self.published.generation.load(Ordering::SeqCst)
    }

    /// Point the connection at a new target and reconnect.
    pub async fn update(&self, target: K::Target) -> Result<(), ConnectError> {
        info!(connection = %self.name, target = %target, "Updating connection target");
        *self.target.lock() = target;
        self.close().await?;
        self.open();
        Ok(())
    }

    /// Stop the loop and drop the published client. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), ConnectError> {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.send(true);
            if let Err(e) = worker.handle.await {
                if e.is_panic() {
                    self.published.clear();
                    return Err(ConnectError::Worker(format!(
                        "{} connection loop panicked",
                        self.name
                    )));
                }
            }
        }
        self.published.clear();
        Ok(())
    }
}

async fn run_loop<K: Connect>(
    name: String,
    connector: Arc<K>,
    target: K::Target,
    published: Arc<Published<K::Client>>,
    retry_delay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        debug!(connection = %name, target = %target, attempt, "Connecting");

        let result = tokio::select! {
            result = connector.connect(&target) => result,
            _ = shutdown_rx.changed() => break,
        };

        match result {
            Ok(client) => {
                let generation = published.publish(client.clone());
                info!(connection = %name, target = %target, generation, "Connection established");
                attempt = 0;

                tokio::select! {
                    _ = connector.closed(&client) => {
                        published.clear();
                        warn!(connection = %name, target = %target, "Connection lost, reconnecting");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            Err(e) => {
                debug!(
                    connection = %name,
                    target = %target,
                    error = %e,
                    "Failed to connect, retrying in {:?}",
                    retry_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    }

    published.clear();
    debug!(connection = %name, "Connection loop stopped");
}
