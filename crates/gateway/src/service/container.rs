//! Container handle: the container half every adapter shares.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ServiceError;
use crate::runtime::{ContainerRuntime, ExecOutput, ExecSession, LogOptions};
use crate::tracker::{ContainerRecord, ContainerTracker};

/// Emitted after each followed log stream ends.
pub const EOF_MARKER: &str = "--- EOF ---";

const RESTART_DELAY: Duration = Duration::from_secs(3);
const FOLLOW_BUFFER: usize = 256;

/// Container-level status, before any kind-specific interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseStatus {
    Disabled,
    Missing,
    Stopped(String),
    Running(Arc<ContainerRecord>),
}

impl BaseStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BaseStatus::Running(_))
    }
}

impl fmt::Display for BaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseStatus::Disabled => write!(f, "Disabled"),
            BaseStatus::Missing => write!(f, "Container missing"),
            BaseStatus::Stopped(state) => write!(f, "Container {}", state),
            BaseStatus::Running(_) => write!(f, "Container running"),
        }
    }
}

pub struct ContainerHandle {
    tracker: Arc<ContainerTracker>,
    runtime: Arc<dyn ContainerRuntime>,
    disabled: bool,
    mode: String,
}

impl ContainerHandle {
    pub fn new(container_name: impl Into<String>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            tracker: Arc::new(ContainerTracker::new(container_name)),
            runtime,
            disabled: false,
            mode: String::new(),
        }
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn container_name(&self) -> &str {
        self.tracker.name()
    }

    pub fn tracker(&self) -> &ContainerTracker {
        &self.tracker
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Absent and switched off in native mode reads as "Disabled"; any
    /// existing container reports its own state.
    pub fn base_status(&self) -> BaseStatus {
        match self.tracker.snapshot() {
            None if self.disabled && (self.mode.is_empty() || self.mode == "native") => {
                BaseStatus::Disabled
            }
            None => BaseStatus::Missing,
            Some(record) if record.is_running() => BaseStatus::Running(record),
            Some(record) => BaseStatus::Stopped(record.state.clone()),
        }
    }

    /// Environment variable of the current container.
    pub fn getenv(&self, key: &str) -> Result<Option<String>, ServiceError> {
        let record = self
            .tracker
            .snapshot()
            .ok_or_else(|| ServiceError::ContainerMissing(self.container_name().to_string()))?;
        Ok(record.getenv(key).map(str::to_string))
    }

    /// Re-inspect the container and publish the result to the tracker.
    pub async fn refresh(&self) -> Result<(), ServiceError> {
        let record = self.runtime.inspect(self.container_name()).await?;
        self.tracker.update(record);
        Ok(())
    }

    pub async fn logs(
        &self,
        since: Option<String>,
        tail: Option<String>,
    ) -> Result<Vec<String>, ServiceError> {
        let options = LogOptions {
            since,
            tail,
            follow: false,
        };
        let mut stream = self.runtime.logs(self.container_name(), options).await?;
        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            lines.push(line?);
        }
        Ok(lines)
    }

    /// Follow logs across container restarts until cancelled.
    ///
    /// Each followed stream ends with [`EOF_MARKER`]; the next one starts
    /// when the container is running again, from its new start time.
    pub fn follow_logs(&self, since: Option<String>, tail: Option<String>) -> LogFollower {
        let (tx, rx) = mpsc::channel(FOLLOW_BUFFER);
        let cancel = CancellationToken::new();
        let options = LogOptions {
            since,
            tail,
            follow: true,
        };

        tokio::spawn(follow_loop(
            self.tracker.clone(),
            self.runtime.clone(),
            options,
            tx,
            cancel.clone(),
        ));

        LogFollower { lines: rx, cancel }
    }

    /// Run a command to completion.
    pub async fn exec(&self, cmd: Vec<String>) -> Result<ExecOutput, ServiceError> {
        Ok(self.runtime.exec(self.container_name(), cmd).await?)
    }

    /// Run a command and fail on a non-zero exit code.
    pub async fn exec_checked(&self, cmd: Vec<String>) -> Result<String, ServiceError> {
        let result = self.exec(cmd).await?;
        if result.success() {
            Ok(result.output)
        } else {
            Err(ServiceError::CommandFailed {
                code: result.exit_code,
                output: result.output.trim().to_string(),
            })
        }
    }

    pub async fn exec_interactive(&self, cmd: Vec<String>) -> Result<ExecSession, ServiceError> {
        Ok(self.runtime.exec_interactive(self.container_name(), cmd).await?)
    }
}

/// Receiving end of [`ContainerHandle::follow_logs`]. Dropping it stops the follower.
pub struct LogFollower {
    lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl LogFollower {
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn follow_loop(
    tracker: Arc<ContainerTracker>,
    runtime: Arc<dyn ContainerRuntime>,
    options: LogOptions,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut first = Some(options);
    let mut previous: Option<Arc<ContainerRecord>> = None;

    loop {
        let running = async {
            match &previous {
                Some(prev) => tracker.await_restart(prev).await,
                None => tracker.await_running().await,
            }
        };
        let record = tokio::select! {
            record = running => record,
            _ = cancel.cancelled() => return,
        };

        let options = first.take().unwrap_or_else(|| LogOptions {
            since: record.started_at.map(|t| t.timestamp().to_string()),
            tail: None,
            follow: true,
        });

        match runtime.logs(tracker.name(), options).await {
            Ok(mut lines) => {
                loop {
                    tokio::select! {
                        line = lines.next() => match line {
                            Some(Ok(line)) => {
                                if tx.send(line).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                debug!(container = %tracker.name(), error = %e, "Log stream failed");
                                break;
                            }
                            None => break,
                        },
                        _ = cancel.cancelled() => return,
                    }
                }
                if tx.send(EOF_MARKER.to_string()).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(container = %tracker.name(), error = %e, "Failed to follow logs");
            }
        }

        previous = Some(record);

        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {}
            _ = cancel.cancelled() => return,
        }
    }
}
