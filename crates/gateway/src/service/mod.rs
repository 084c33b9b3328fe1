//! Service adapters.
//!
//! One adapter per backend kind. Every adapter owns a [`ContainerHandle`]
//! (tracker + runtime access) and whatever upstream connections its kind
//! needs, and turns both into one human-readable status string.

pub mod basic;
pub mod bitcoind;
pub mod boltz;
pub mod connext;
pub mod container;
pub mod context;
pub mod factory;
pub mod geth;
pub mod lnd;
pub mod opendexd;
pub mod registry;

use std::any::Any;

use thiserror::Error;

use crate::docker::client::DockerError;
use crate::rpc::{ConnectError, RpcError};
use crate::runtime::{BoxFuture, ExecOutput, ExecSession};

pub use container::{BaseStatus, ContainerHandle, LogFollower};
pub use context::StatusContext;
pub use registry::ServiceRegistry;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Container not found: {0}")]
    ContainerMissing(String),
    #[error(transparent)]
    Runtime(#[from] DockerError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Command exited with code {code}: {output}")]
    CommandFailed { code: i64, output: String },
    #[error("Sibling service unavailable: {0}")]
    Sibling(String),
    #[error("Malformed data: {0}")]
    Malformed(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A backend the gateway fronts.
///
/// Only `status` is kind-specific; container access defaults to the shared
/// [`ContainerHandle`].
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn container(&self) -> &ContainerHandle;

    /// Human-readable status. Never fails: errors become part of the text.
    fn status<'a>(&'a self, ctx: &'a StatusContext) -> BoxFuture<'a, String>;

    /// Concrete adapter access for sibling lookups.
    fn as_any(&self) -> &dyn Any;

    /// Start upstream connections.
    fn open(&self) {}

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async { Ok(()) })
    }

    fn logs(
        &self,
        since: Option<String>,
        tail: Option<String>,
    ) -> BoxFuture<'_, Result<Vec<String>, ServiceError>> {
        Box::pin(self.container().logs(since, tail))
    }

    fn follow_logs(&self, since: Option<String>, tail: Option<String>) -> LogFollower {
        self.container().follow_logs(since, tail)
    }

    fn exec(&self, cmd: Vec<String>) -> BoxFuture<'_, Result<ExecOutput, ServiceError>> {
        Box::pin(self.container().exec(cmd))
    }

    fn exec_interactive(&self, cmd: Vec<String>) -> BoxFuture<'_, Result<ExecSession, ServiceError>> {
        Box::pin(self.container().exec_interactive(cmd))
    }
}

/// `"Ready"` once `current` reaches a non-zero `total`, otherwise the
/// percentage with both heights.
pub fn sync_progress(current: u64, total: u64) -> String {
    if total > 0 && current == total {
        return "Ready".to_string();
    }
    let percent = if total == 0 {
        0.0
    } else {
        current as f64 / total as f64 * 100.0
    };
    format!("{:.2}% ({}/{})", percent, current, total)
}

/// `sync_progress` phrased as a status line.
pub fn sync_status(current: u64, total: u64) -> String {
    let progress = sync_progress(current, total);
    if progress == "Ready" {
        progress
    } else {
        format!("Syncing {}", progress)
    }
}

pub(crate) fn waiting_for(name: &str) -> String {
    format!("Waiting for {} to come up...", name)
}
