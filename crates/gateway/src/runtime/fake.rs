//! Fake: test double for the container runtime.
//!
//! Provides a deterministic [`FakeRuntime`] that implements
//! [`ContainerRuntime`] using in-memory state. Events are injected with
//! [`FakeRuntime::emit`] and delivered to the current `events()` subscriber.
//! [`FakeRuntime::close_events`] ends that stream; the next subscriber gets
//! a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    BoxFuture, ContainerRuntime, EventStream, ExecOutput, ExecSession, LineStream, LogOptions,
    RuntimeEvent,
};
use crate::docker::client::DockerError;
use crate::tracker::ContainerRecord;

/// A canned container for the fake store.
#[derive(Clone, Debug)]
pub struct FakeContainer {
    pub record: ContainerRecord,
    pub logs: Vec<String>,
    /// Exec results keyed by the space-joined command line.
    pub exec: HashMap<String, ExecOutput>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, FakeContainer>,
    events_tx: Option<mpsc::UnboundedSender<RuntimeEvent>>,
    events_rx: Option<mpsc::UnboundedReceiver<RuntimeEvent>>,
}

/// A fake container runtime for deterministic testing.
pub struct FakeRuntime {
    inner: Mutex<Inner>,
    inspect_calls: AtomicUsize,
    exec_calls: AtomicUsize,
    event_subscriptions: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(Inner {
                containers: HashMap::new(),
                events_tx: Some(tx),
                events_rx: Some(rx),
            }),
            inspect_calls: AtomicUsize::new(0),
            exec_calls: AtomicUsize::new(0),
            event_subscriptions: AtomicUsize::new(0),
        }
    }

    /// Seed a container, replacing any with the same name.
    pub fn add_container(&self, record: ContainerRecord) {
        self.inner.lock().containers.insert(
            record.name.clone(),
            FakeContainer {
                record,
                logs: Vec::new(),
                exec: HashMap::new(),
            },
        );
    }

    pub fn remove_container(&self, name: &str) {
        self.inner.lock().containers.remove(name);
    }

    pub fn set_logs(&self, name: &str, lines: &[&str]) {
        if let Some(c) = self.inner.lock().containers.get_mut(name) {
            c.logs = lines.iter().map(|l| l.to_string()).collect();
        }
    }

    pub fn set_exec_result(&self, name: &str, cmd: &[&str], result: ExecOutput) {
        if let Some(c) = self.inner.lock().containers.get_mut(name) {
            c.exec.insert(cmd.join(" "), result);
        }
    }

    /// Queue an event for the `events()` subscriber.
    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = self.inner.lock().events_tx.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// End the current event stream. Later events queue for the next subscriber.
    pub fn close_events(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.events_tx = Some(tx);
        inner.events_rx = Some(rx);
    }

    pub fn event_subscriptions(&self) -> usize {
        self.event_subscriptions.load(Ordering::SeqCst)
    }

    pub fn inspect_count(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }

    fn find(&self, name: &str) -> Option<FakeContainer> {
        let inner = self.inner.lock();
        inner
            .containers
            .get(name)
            .or_else(|| inner.containers.values().find(|c| c.record.id == name))
            .cloned()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn inspect<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<ContainerRecord>, DockerError>> {
        Box::pin(async move {
            self.inspect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.find(name).map(|c| c.record))
        })
    }

    fn events(&self, _since: Option<i64>) -> EventStream {
        self.event_subscriptions.fetch_add(1, Ordering::SeqCst);
        let rx = self.inner.lock().events_rx.take();
        let Some(mut rx) = rx else {
            return Box::pin(tokio_stream::empty::<Result<RuntimeEvent, DockerError>>());
        };
        Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield Ok(event);
            }
        })
    }

    fn logs<'a>(
        &'a self,
        name: &'a str,
        options: LogOptions,
    ) -> BoxFuture<'a, Result<LineStream, DockerError>> {
        Box::pin(async move {
            let container = self
                .find(name)
                .ok_or_else(|| DockerError::ContainerNotFound(name.to_string()))?;

            let mut lines = container.logs;
            if let Some(tail) = options.tail.as_deref().and_then(|t| t.parse::<usize>().ok()) {
                let skip = lines.len().saturating_sub(tail);
                lines.drain(..skip);
            }

            let stream: LineStream = Box::pin(tokio_stream::iter(lines.into_iter().map(Ok)));
            Ok(stream)
        })
    }

    fn exec<'a>(
        &'a self,
        name: &'a str,
        cmd: Vec<String>,
    ) -> BoxFuture<'a, Result<ExecOutput, DockerError>> {
        Box::pin(async move {
            self.exec_calls.fetch_add(1, Ordering::SeqCst);
            let container = self
                .find(name)
                .ok_or_else(|| DockerError::ContainerNotFound(name.to_string()))?;

            Ok(container
                .exec
                .get(&cmd.join(" "))
                .cloned()
                .unwrap_or(ExecOutput {
                    output: format!("{}: command not found", cmd.join(" ")),
                    exit_code: 127,
                }))
        })
    }

    fn exec_interactive<'a>(
        &'a self,
        name: &'a str,
        cmd: Vec<String>,
    ) -> BoxFuture<'a, Result<ExecSession, DockerError>> {
        Box::pin(async move {
            let result = self.exec(name, cmd).await?;
            let chunk = Bytes::from(result.output.into_bytes());
            Ok(ExecSession {
                exec_id: "fake-exec".to_string(),
                output: Box::pin(tokio_stream::iter(vec![Ok(chunk)])),
                input: Box::pin(tokio::io::sink()),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeEventKind;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_inspect_by_name_and_id() {
        let runtime = FakeRuntime::new();
        runtime.add_container(ContainerRecord::new("id1", "simnet_geth_1", "running"));

        assert!(runtime.inspect("simnet_geth_1").await.unwrap().is_some());
        assert!(runtime.inspect("id1").await.unwrap().is_some());
        assert!(runtime.inspect("simnet_lndbtc_1").await.unwrap().is_none());
        assert_eq!(runtime.inspect_count(), 3);
    }

    #[tokio::test]
    async fn test_logs_honour_tail() {
        let runtime = FakeRuntime::new();
        runtime.add_container(ContainerRecord::new("id1", "simnet_geth_1", "running"));
        runtime.set_logs("simnet_geth_1", &["a", "b", "c"]);

        let options = LogOptions {
            tail: Some("2".into()),
            ..Default::default()
        };
        let lines: Vec<_> = runtime
            .logs("simnet_geth_1", options)
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_events_are_delivered_once() {
        let runtime = FakeRuntime::new();
        let mut events = runtime.events(None);
        runtime.emit(RuntimeEvent {
            container_id: "id1".into(),
            name: None,
            kind: RuntimeEventKind::Started,
        });
        runtime.close_events();

        assert_eq!(events.next().await.unwrap().unwrap().kind, RuntimeEventKind::Started);
        assert!(events.next().await.is_none());

        runtime.emit(RuntimeEvent {
            container_id: "id1".into(),
            name: None,
            kind: RuntimeEventKind::Died,
        });
        let mut resubscribed = runtime.events(None);
        assert_eq!(resubscribed.next().await.unwrap().unwrap().kind, RuntimeEventKind::Died);
        assert_eq!(runtime.event_subscriptions(), 2);
    }
}
