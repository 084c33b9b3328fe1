//! Container lifecycle tracker.
//!
//! Holds the latest known snapshot of one named container and lets callers
//! wait until the container exists or is running. Snapshots are replaced
//! wholesale, so readers never observe a partially updated record.
//!
//! Waiters register and are released under the same lock as the snapshot
//! swap. A waiter is handed the exact record that satisfied it, so a burst of
//! `created → running → exited` still releases `await_running` with the
//! `running` record even if the waiting task never observed it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Running,
    Exited,
}

impl Phase {
    /// Maps a raw engine state. Anything that is neither `created` nor
    /// `running` (exited, dead, paused, restarting, removing) is `Exited`.
    pub fn from_state(state: &str) -> Self {
        match state {
            "created" => Phase::Created,
            "running" => Phase::Running,
            _ => Phase::Exited,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub phase: Phase,
    /// Raw engine state, kept for display.
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub env: HashMap<String, String>,
}

impl ContainerRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: impl Into<String>) -> Self {
        let state = state.into();
        Self {
            id: id.into(),
            name: name.into(),
            phase: Phase::from_state(&state),
            state,
            started_at: None,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Want {
    Record,
    Running,
    /// Running, and not the same start as the one described here.
    Restarted {
        id: String,
        started_at: Option<DateTime<Utc>>,
    },
}

impl Want {
    fn satisfied_by(&self, record: &ContainerRecord) -> bool {
        match self {
            Want::Record => true,
            Want::Running => record.is_running(),
            Want::Restarted { id, started_at } => {
                record.is_running() && (record.id != *id || record.started_at != *started_at)
            }
        }
    }
}

struct Waiter {
    want: Want,
    tx: oneshot::Sender<Arc<ContainerRecord>>,
}

#[derive(Default)]
struct Inner {
    current: Option<Arc<ContainerRecord>>,
    waiters: Vec<Waiter>,
}

pub struct ContainerTracker {
    name: String,
    inner: Mutex<Inner>,
}

impl ContainerTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Container name this tracker follows.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the snapshot. `None` means the container does not exist.
    ///
    /// Every waiter whose condition holds for the new record is released
    /// with that record; the rest stay registered.
    pub fn update(&self, record: Option<ContainerRecord>) {
        let record = record.map(Arc::new);
        let mut inner = self.inner.lock();
        inner.current = record.clone();

        let waiters = std::mem::take(&mut inner.waiters);
        inner.waiters = match record {
            Some(record) => waiters
                .into_iter()
                .filter_map(|waiter| {
                    if waiter.tx.is_closed() {
                        return None;
                    }
                    if waiter.want.satisfied_by(&record) {
                        let _ = waiter.tx.send(record.clone());
                        None
                    } else {
                        Some(waiter)
                    }
                })
                .collect(),
            None => waiters.into_iter().filter(|w| !w.tx.is_closed()).collect(),
        };
    }

    pub fn snapshot(&self) -> Option<Arc<ContainerRecord>> {
        self.inner.lock().current.clone()
    }

    /// Evaluate a predicate against the current snapshot.
    pub fn query<F>(&self, predicate: F) -> bool
    where
        F: FnOnce(Option<&ContainerRecord>) -> bool,
    {
        let inner = self.inner.lock();
        predicate(inner.current.as_deref())
    }

    pub fn is_running(&self) -> bool {
        self.query(|r| r.is_some_and(ContainerRecord::is_running))
    }

    pub fn container_id(&self) -> Option<String> {
        self.inner.lock().current.as_ref().map(|r| r.id.clone())
    }

    /// Resolves once the container exists.
    pub async fn await_record(&self) -> Arc<ContainerRecord> {
        self.wait(Want::Record).await
    }

    /// Resolves once the container is running.
    pub async fn await_running(&self) -> Arc<ContainerRecord> {
        self.wait(Want::Running).await
    }

    /// Resolves once the container is running again after `previous`.
    pub async fn await_restart(&self, previous: &ContainerRecord) -> Arc<ContainerRecord> {
        self.wait(Want::Restarted {
            id: previous.id.clone(),
            started_at: previous.started_at,
        })
        .await
    }

    async fn wait(&self, want: Want) -> Arc<ContainerRecord> {
        loop {
            let rx = {
                let mut inner = self.inner.lock();
                if let Some(record) = inner.current.as_ref() {
                    if want.satisfied_by(record) {
                        return record.clone();
                    }
                }
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(Waiter {
                    want: want.clone(),
                    tx,
                });
                rx
            };

            if let Ok(record) = rx.await {
                return record;
            }
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(state: &str) -> ContainerRecord {
        ContainerRecord::new("c1", "simnet_lndbtc_1", state)
    }

    async fn until_registered(tracker: &ContainerTracker, count: usize) {
        while tracker.waiter_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(Phase::from_state("created"), Phase::Created);
        assert_eq!(Phase::from_state("running"), Phase::Running);
        assert_eq!(Phase::from_state("exited"), Phase::Exited);
        assert_eq!(Phase::from_state("paused"), Phase::Exited);
        assert_eq!(Phase::from_state("restarting"), Phase::Exited);
    }

    #[test]
    fn test_snapshot_and_query() {
        let tracker = ContainerTracker::new("simnet_lndbtc_1");
        assert!(tracker.snapshot().is_none());
        assert!(tracker.query(|r| r.is_none()));
        assert!(!tracker.is_running());

        tracker.update(Some(record("running")));
        assert!(tracker.is_running());
        assert_eq!(tracker.container_id().as_deref(), Some("c1"));

        tracker.update(None);
        assert!(tracker.snapshot().is_none());
        assert!(tracker.container_id().is_none());
    }

    #[tokio::test]
    async fn test_await_record_returns_immediately_when_present() {
        let tracker = ContainerTracker::new("simnet_lndbtc_1");
        tracker.update(Some(record("exited")));

        let got = tokio::time::timeout(Duration::from_millis(50), tracker.await_record())
            .await
            .unwrap();
        assert_eq!(got.phase, Phase::Exited);
        assert_eq!(tracker.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_running_waiter_released_by_transient_running_state() {
        let tracker = Arc::new(ContainerTracker::new("simnet_lndbtc_1"));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.await_running().await })
        };
        until_registered(&tracker, 1).await;

        tracker.update(Some(record("created")));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(tracker.waiter_count(), 1);

        // running then exited back to back, no yield in between
        tracker.update(Some(record("running")));
        tracker.update(Some(record("exited")));

        let got = waiter.await.unwrap();
        assert_eq!(got.phase, Phase::Running);
        assert_eq!(got.state, "running");
        assert_eq!(tracker.snapshot().unwrap().phase, Phase::Exited);
        assert_eq!(tracker.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_record_waiter_gets_first_record() {
        let tracker = Arc::new(ContainerTracker::new("simnet_lndbtc_1"));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.await_record().await })
        };
        until_registered(&tracker, 1).await;

        tracker.update(None);
        tracker.update(Some(record("created")));
        tracker.update(Some(record("running")));

        assert_eq!(waiter.await.unwrap().phase, Phase::Created);
    }

    #[tokio::test]
    async fn test_restart_waiter_ignores_same_start() {
        let started = Utc::now();
        let first = record("running").with_started_at(started);
        let tracker = Arc::new(ContainerTracker::new("simnet_lndbtc_1"));
        tracker.update(Some(first.clone()));

        let waiter = {
            let tracker = tracker.clone();
            let first = first.clone();
            tokio::spawn(async move { tracker.await_restart(&first).await })
        };
        until_registered(&tracker, 1).await;

        tracker.update(Some(first.clone()));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let second = record("running").with_started_at(started + chrono::Duration::seconds(5));
        tracker.update(Some(second.clone()));
        assert_eq!(*waiter.await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_pruned() {
        let tracker = ContainerTracker::new("simnet_lndbtc_1");
        {
            let fut = tracker.await_running();
            let _ = tokio::time::timeout(Duration::from_millis(5), fut).await;
        }
        assert_eq!(tracker.waiter_count(), 1);

        tracker.update(Some(record("created")));
        assert_eq!(tracker.waiter_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_update_never_loses_wakeup() {
        for _ in 0..200 {
            let tracker = Arc::new(ContainerTracker::new("simnet_lndbtc_1"));

            let waiter = {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.await_running().await })
            };
            let updater = {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tracker.update(Some(record("created")));
                    tracker.update(Some(record("running")));
                })
            };

            updater.await.unwrap();
            let got = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("waiter must be released")
                .unwrap();
            assert_eq!(got.phase, Phase::Running);
        }
    }
}
