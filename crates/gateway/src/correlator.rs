//! Request correlator: request/response matching over one message stream.
//!
//! Outbound requests get a fresh id and a one-shot slot in the pending map.
//! A single reader feeds every inbound text frame to
//! [`RequestCorrelator::on_inbound_message`], which completes the slot with
//! the matching id. Frames carrying a `method` are requests from the peer and
//! go to the peer-request channel instead.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
}

impl Response {
    /// The result, or the peer's error rendered as text.
    pub fn into_result(self) -> Result<Value, CorrelatorError> {
        match self.error {
            Value::Null => Ok(self.result),
            Value::String(message) => Err(CorrelatorError::Remote(message)),
            other => Err(CorrelatorError::Remote(other.to_string())),
        }
    }
}

// Requests must be tried first: a request also has an `id`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Inbound {
    Request(Request),
    Response(Response),
}

struct Inner {
    outbound: mpsc::Sender<String>,
    peer_requests: Option<mpsc::UnboundedSender<Request>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Pending {
    slots: HashMap<u64, oneshot::Sender<Response>>,
    closed: bool,
}

#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

impl RequestCorrelator {
    /// `outbound` carries encoded frames to the writer task.
    pub fn new(
        outbound: mpsc::Sender<String>,
        peer_requests: Option<mpsc::UnboundedSender<Request>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbound,
                peer_requests,
                pending: Mutex::new(Pending::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Send a request and return a future for its response.
    pub async fn send(&self, method: &str, params: Value) -> Result<PendingResponse, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.inner.pending.lock();
            if pending.closed {
                return Err(CorrelatorError::ConnectionClosed);
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            pending.slots.insert(id, tx);
            id
        };

        // From here on the slot is owned by the guard and removed on any early return
        let response = PendingResponse {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        };

        let frame = serde_json::to_string(&Request {
            id,
            method: method.to_string(),
            params,
        })?;

        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| CorrelatorError::ConnectionClosed)?;

        debug!(id, method, "Request sent");
        Ok(response)
    }

    /// Send and wait for the response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Response, CorrelatorError> {
        self.send(method, params).await?.await
    }

    /// Feed one inbound text frame.
    pub fn on_inbound_message(&self, raw: &str) {
        match serde_json::from_str::<Inbound>(raw) {
            Ok(Inbound::Request(request)) => match &self.inner.peer_requests {
                Some(handler) => {
                    if handler.send(request).is_err() {
                        debug!("Peer request handler gone, dropping request");
                    }
                }
                None => debug!(method = %request.method, "No peer request handler, dropping request"),
            },
            Ok(Inbound::Response(response)) => {
                let slot = self.inner.pending.lock().slots.remove(&response.id);
                match slot {
                    Some(tx) => {
                        if tx.send(response).is_err() {
                            debug!("Caller stopped waiting for response");
                        }
                    }
                    None => debug!(id = response.id, "Dropping response with unknown id"),
                }
            }
            Err(e) => debug!(error = %e, "Dropping unparsable message"),
        }
    }

    /// Release every pending caller with `ConnectionClosed` and refuse new sends.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut pending = self.inner.pending.lock();
            pending.closed = true;
            pending.slots.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Releasing pending requests");
        }
        // Dropping the senders completes the receivers
        drop(drained);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().slots.len()
    }
}

/// Resolves with the response to one request. Dropping it frees the slot.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Response>,
    inner: Weak<Inner>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Response, CorrelatorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| CorrelatorError::ConnectionClosed))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.pending.lock().slots.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn correlator() -> (RequestCorrelator, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(256);
        (RequestCorrelator::new(tx, None), rx)
    }

    fn reply(id: u64, result: Value) -> String {
        json!({ "id": id, "result": result, "error": null }).to_string()
    }

    #[tokio::test]
    async fn test_request_wire_format() {
        let (correlator, mut wire) = correlator();
        let _pending = correlator.send("getinfo", json!([])).await.unwrap();

        let frame: Value = serde_json::from_str(&wire.recv().await.unwrap()).unwrap();
        assert_eq!(frame["method"], "getinfo");
        assert_eq!(frame["params"], json!([]));
        assert!(frame["id"].is_u64());
    }

    #[tokio::test]
    async fn test_concurrent_sends_match_out_of_order_replies() {
        let (correlator, mut wire) = correlator();

        let mut callers = Vec::new();
        for _ in 0..100 {
            let correlator = correlator.clone();
            callers.push(tokio::spawn(async move {
                let pending = correlator.send("echo", json!([])).await.unwrap();
                let id = pending.id();
                (id, pending.await.unwrap())
            }));
        }

        let mut ids = Vec::new();
        for _ in 0..100 {
            let frame: Request = serde_json::from_str(&wire.recv().await.unwrap()).unwrap();
            ids.push(frame.id);
        }
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);

        // Deterministic shuffle
        ids.sort_by_key(|id| (id * 37) % 101);
        for id in &ids {
            correlator.on_inbound_message(&reply(*id, json!(id * 2)));
        }

        for caller in callers {
            let (id, response) = caller.await.unwrap();
            assert_eq!(response.id, id);
            assert_eq!(response.result, json!(id * 2));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let (correlator, _wire) = correlator();
        let pending = correlator.send("getinfo", json!([])).await.unwrap();

        correlator.on_inbound_message(&reply(pending.id() + 1000, json!("stray")));
        assert_eq!(correlator.pending_count(), 1);

        correlator.on_inbound_message(&reply(pending.id(), json!("ok")));
        assert_eq!(pending.await.unwrap().result, json!("ok"));
    }

    #[tokio::test]
    async fn test_close_releases_pending_callers() {
        let (correlator, _wire) = correlator();
        let first = correlator.send("getinfo", json!([])).await.unwrap();
        let second = correlator.send("backupto", json!(["/backup"])).await.unwrap();

        correlator.close();

        assert!(matches!(first.await, Err(CorrelatorError::ConnectionClosed)));
        assert!(matches!(second.await, Err(CorrelatorError::ConnectionClosed)));
        assert!(matches!(
            correlator.send("getinfo", json!([])).await,
            Err(CorrelatorError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_caller_frees_slot() {
        let (correlator, _wire) = correlator();
        let pending = correlator.send("getinfo", json!([])).await.unwrap();
        assert_eq!(correlator.pending_count(), 1);

        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_gone_fails_send() {
        let (correlator, wire) = correlator();
        drop(wire);

        assert!(matches!(
            correlator.send("getinfo", json!([])).await,
            Err(CorrelatorError::ConnectionClosed)
        ));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_requests_are_routed_to_handler() {
        let (tx, _wire) = mpsc::channel(8);
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        let correlator = RequestCorrelator::new(tx, Some(peer_tx));

        correlator.on_inbound_message(r#"{"id":7,"method":"ping","params":[]}"#);
        correlator.on_inbound_message("not json");

        let request = peer_rx.recv().await.unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.method, "ping");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_response_error_text() {
        let ok = Response {
            id: 1,
            result: json!({"a": 1}),
            error: Value::Null,
        };
        assert_eq!(ok.into_result().unwrap(), json!({"a": 1}));

        let failed = Response {
            id: 1,
            result: Value::Null,
            error: json!("no such location"),
        };
        assert!(matches!(
            failed.into_result(),
            Err(CorrelatorError::Remote(m)) if m == "no such location"
        ));
    }
}
