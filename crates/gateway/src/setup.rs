//! Setup-status agent.
//!
//! The launcher writes its progress to a log file. The agent follows that
//! file, turns known lines into [`SetupStatus`] entries, keeps a bounded
//! history and fans new entries out to subscribers. Its [`SetupState`] is the
//! hint adapters use to report "Waiting for sync" while the stack is still
//! being set up.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub const HISTORY_LIMIT: usize = 100;
pub const DONE: &str = "Done";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupState {
    #[default]
    Unknown,
    Setup,
    Attached,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupStatus {
    pub status: String,
    pub details: Option<BTreeMap<String, String>>,
}

impl SetupStatus {
    fn plain(status: &str) -> Self {
        Self {
            status: status.to_string(),
            details: None,
        }
    }
}

/// Phases announced by the launcher, in the order they are checked.
const PHASES: &[&str] = &[
    "Waiting for XUD dependencies to be ready",
    "Setup wallets",
    "Create wallets",
    "Restore wallets",
    "Setup backup location",
    "Unlock wallets",
];

/// Interpret one launcher log line. Unknown lines yield `None`.
pub fn classify_line(line: &str) -> Option<(SetupState, SetupStatus)> {
    if let Some((_, progress)) = line.split_once(" [LightSync] ") {
        let details = progress
            .split(" | ")
            .filter_map(|part| part.split_once(": "))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        let status = SetupStatus {
            status: "Syncing light clients".to_string(),
            details: Some(details),
        };
        return Some((SetupState::Setup, status));
    }

    if line.contains("Start shell") {
        return Some((SetupState::Attached, SetupStatus::plain(DONE)));
    }

    PHASES
        .iter()
        .find(|phase| line.contains(*phase))
        .map(|phase| (SetupState::Setup, SetupStatus::plain(phase)))
}

pub struct SetupAgent {
    log_path: PathBuf,
    state: RwLock<SetupState>,
    history: Mutex<VecDeque<SetupStatus>>,
    tx: broadcast::Sender<SetupStatus>,
}

impl SetupAgent {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(HISTORY_LIMIT);
        Self {
            log_path: log_path.into(),
            state: RwLock::new(SetupState::Unknown),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            tx,
        }
    }

    pub fn state(&self) -> SetupState {
        *self.state.read()
    }

    pub fn handle_line(&self, line: &str) {
        let Some((state, status)) = classify_line(line) else {
            return;
        };
        debug!(status = %status.status, "Setup status");
        *self.state.write() = state;

        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(status.clone());
        // Sent under the history lock so subscribers never miss or repeat an entry
        let _ = self.tx.send(status);
    }

    /// Replayed history plus a receiver for everything after it.
    ///
    /// `history` is the number of past entries to replay: `-1` for all of
    /// them, `0` for none.
    pub fn subscribe(&self, history: isize) -> (Vec<SetupStatus>, broadcast::Receiver<SetupStatus>) {
        let past = self.history.lock();
        let rx = self.tx.subscribe();
        let skip = match usize::try_from(history) {
            Ok(n) => past.len().saturating_sub(n),
            Err(_) if history == -1 => 0,
            Err(_) => past.len(),
        };
        (past.iter().skip(skip).cloned().collect(), rx)
    }

    /// Follow the launcher log until shutdown or until `tail` exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let mut child = Command::new("tail")
            .arg("-F")
            .arg(&self.log_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            return Err(std::io::Error::other("tail has no stdout"));
        };
        *self.state.write() = SetupState::Attached;
        info!(path = %self.log_path.display(), "Following launcher log");

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => {
                        warn!(path = %self.log_path.display(), "Launcher log follower exited");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read launcher log");
                        break;
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        child.kill().await.ok();
        Ok(())
    }
}
