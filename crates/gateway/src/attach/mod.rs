//! Launcher attachment.
//!
//! A launcher attaches over a WebSocket and answers requests such as
//! `getinfo` and `backupto`. Each connection becomes a [`LauncherSession`]
//! over a [`RequestCorrelator`]; the [`LauncherRegistry`] routes calls to the
//! longest-attached session.

pub mod socket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::correlator::{CorrelatorError, Request, RequestCorrelator, Response};

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("no launcher")]
    NoLauncher,
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error("launcher did not answer in time")]
    Timeout,
    #[error("Malformed launcher response: {0}")]
    Malformed(String),
}

pub struct LauncherSession {
    id: u64,
    correlator: RequestCorrelator,
}

impl LauncherSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    async fn call(&self, method: &str, params: Value, deadline: Instant) -> Result<Value, AttachError> {
        let response: Response = tokio::time::timeout_at(deadline, self.correlator.call(method, params))
            .await
            .map_err(|_| AttachError::Timeout)??;
        Ok(response.into_result()?)
    }

    /// Launcher info. The launcher sends it as a JSON document inside a string.
    pub async fn get_info(&self, deadline: Instant) -> Result<Value, AttachError> {
        match self.call("getinfo", json!([]), deadline).await? {
            Value::String(raw) => {
                serde_json::from_str(&raw).map_err(|e| AttachError::Malformed(e.to_string()))
            }
            other => Ok(other),
        }
    }

    pub async fn update_backup(&self, location: &str, deadline: Instant) -> Result<(), AttachError> {
        self.call("backupto", json!([location]), deadline).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct LauncherRegistry {
    sessions: DashMap<u64, Arc<LauncherSession>>,
    next_id: AtomicU64,
}

impl LauncherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session whose frames go out through `outbound`.
    pub fn register(&self, outbound: mpsc::Sender<String>) -> Arc<LauncherSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<Request>();

        tokio::spawn(async move {
            while let Some(request) = peer_rx.recv().await {
                debug!(session = id, id = request.id, method = %request.method, "Launcher request");
            }
        });

        let session = Arc::new(LauncherSession {
            id,
            correlator: RequestCorrelator::new(outbound, Some(peer_tx)),
        });
        self.sessions.insert(id, session.clone());
        info!(session = id, launchers = self.sessions.len(), "Launcher attached");
        session
    }

    /// Drop a session and release its pending callers.
    pub fn remove(&self, id: u64) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            session.correlator.close();
            info!(session = id, launchers = self.sessions.len(), "Launcher detached");
        }
    }

    /// The longest-attached session.
    pub fn first(&self) -> Option<Arc<LauncherSession>> {
        self.sessions
            .iter()
            .min_by_key(|entry| *entry.key())
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn get_info(&self, deadline: Instant) -> Result<Value, AttachError> {
        let session = self.first().ok_or(AttachError::NoLauncher)?;
        session.get_info(deadline).await
    }

    pub async fn update_backup(&self, location: &str, deadline: Instant) -> Result<(), AttachError> {
        let session = self.first().ok_or(AttachError::NoLauncher)?;
        session.update_backup(location, deadline).await
    }
}
