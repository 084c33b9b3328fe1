//! Runtime: abstract interface over the container engine.
//!
//! Adapters and the fleet manager only see [`ContainerRuntime`].
//! `crate::docker` provides the Bollard-backed implementation,
//! [`fake::FakeRuntime`] provides a deterministic test double.

pub mod fake;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio_stream::Stream;

use crate::docker::client::DockerError;
use crate::tracker::ContainerRecord;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Log output split into lines.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, DockerError>> + Send>>;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<RuntimeEvent, DockerError>> + Send>>;

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes, DockerError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEventKind {
    Created,
    Started,
    Died,
    Destroyed,
}

impl RuntimeEventKind {
    /// Maps an engine action name; actions the gateway does not track yield `None`.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Created),
            "start" => Some(Self::Started),
            "die" => Some(Self::Died),
            "destroy" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub container_id: String,
    /// Container name from the event attributes, when the engine sent one.
    pub name: Option<String>,
    pub kind: RuntimeEventKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Unix seconds, RFC 3339 timestamp or a relative duration such as `10m`.
    pub since: Option<String>,
    /// Number of trailing lines, or `all`.
    pub tail: Option<String>,
    pub follow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Attached interactive exec: bytes out, bytes in.
pub struct ExecSession {
    pub exec_id: String,
    pub output: OutputStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Unified async interface over the container engine.
///
/// Object-safe thanks to boxed future returns. Implementations must be
/// `Send + Sync` so they can be shared behind an `Arc`.
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a container by name or id. A missing container is `Ok(None)`.
    fn inspect<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<ContainerRecord>, DockerError>>;

    /// Container lifecycle events, optionally replayed from a Unix timestamp.
    fn events(&self, since: Option<i64>) -> EventStream;

    fn logs<'a>(
        &'a self,
        name: &'a str,
        options: LogOptions,
    ) -> BoxFuture<'a, Result<LineStream, DockerError>>;

    /// Run a command to completion and collect its combined output.
    fn exec<'a>(
        &'a self,
        name: &'a str,
        cmd: Vec<String>,
    ) -> BoxFuture<'a, Result<ExecOutput, DockerError>>;

    fn exec_interactive<'a>(
        &'a self,
        name: &'a str,
        cmd: Vec<String>,
    ) -> BoxFuture<'a, Result<ExecSession, DockerError>>;
}
