//! WebSocket transport for launcher sessions.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::LauncherRegistry;

const OUTBOUND_BUFFER: usize = 64;

/// Run one attached launcher until its socket closes or the gateway shuts down.
///
/// A writer task drains the session's outbound frames; this task is the
/// session's single reader.
pub async fn serve_socket(
    registry: Arc<LauncherRegistry>,
    socket: WebSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let session = registry.register(tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                debug!(error = %e, "Failed to write to launcher");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        match message {
            Some(Ok(Message::Text(text))) => session.correlator().on_inbound_message(text.as_str()),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => debug!(session = session.id(), "Ignoring non-text frame"),
            Some(Err(e)) => {
                debug!(session = session.id(), error = %e, "Launcher socket failed");
                break;
            }
        }
    }

    registry.remove(session.id());
    writer.abort();
}
