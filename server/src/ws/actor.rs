use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::hub::RealtimeHub;
use crate::ws::connection::{CloseReason, ConnectionHandle};
use crate::ws::protocol::{self, ServerMessage};
use crate::ws::registry::Connection;
use crate::ws::new_connection_id;

/// How long the writer may spend flushing a close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long cleanup waits for the writer before aborting it.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Run the actor-per-connection pattern for an accepted WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, drains the connection's bounded queue
/// - Reader loop: touches liveness on every frame, dispatches text frames
///
/// Either side can end the connection through the shared handle; the
/// registry entry is removed exactly once on the way out.
pub async fn run_connection(
    socket: WebSocket,
    hub: Arc<RealtimeHub>,
    remote_address: Option<SocketAddr>,
    user_agent: Option<String>,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(hub.settings().outbound_buffer);

    let conn_id = new_connection_id();
    let handle = ConnectionHandle::new(conn_id.clone(), tx);
    let registry = hub.registry().clone();
    registry.register(Connection::new(handle.clone(), remote_address, user_agent.clone()));

    tracing::info!(
        conn_id = %conn_id,
        remote = ?remote_address,
        user_agent = user_agent.as_deref().unwrap_or("-"),
        "WebSocket actor started"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx, handle.clone()));

    if hub.is_shutting_down() {
        // Raced with stop(): it may have swept before we registered
        registry.evict(&conn_id, CloseReason::ServerShutdown);
    } else {
        let _ = hub
            .broadcaster()
            .send_to(&handle, &ServerMessage::connection(&conn_id));
    }

    // Reader loop: process incoming WebSocket messages
    loop {
        let next = tokio::select! {
            _ = handle.closed() => break,
            next = ws_receiver.next() => next,
        };

        match next {
            Some(Ok(msg)) => {
                registry.touch(&conn_id);
                match msg {
                    Message::Text(text) => {
                        protocol::handle_text_message(text.as_str(), &handle, &hub).await;
                    }
                    Message::Binary(_) => {
                        let _ = hub.broadcaster().send_to(
                            &handle,
                            &ServerMessage::error("Binary messages are not supported"),
                        );
                    }
                    // Pings are answered by the transport; both count as liveness
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(frame) => {
                        tracing::info!(conn_id = %conn_id, reason = ?frame, "Client initiated close");
                        handle.close(CloseReason::ClientClosed);
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                handle.close(CloseReason::TransportError);
                break;
            }
            None => {
                tracing::info!(conn_id = %conn_id, "WebSocket stream ended");
                handle.close(CloseReason::ClientClosed);
                break;
            }
        }
    }

    // No-op if an evictor already removed us
    registry.remove(&conn_id);
    handle.close(CloseReason::ClientClosed);

    if timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }

    tracing::info!(
        conn_id = %conn_id,
        reason = handle.close_reason().map(|r| r.as_str()).unwrap_or("unknown"),
        "WebSocket actor stopped"
    );
}

/// Writer task: forwards queued messages to the WebSocket sink until the
/// connection is closed, then sends the close frame for the recorded reason.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    handle: ConnectionHandle,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = handle.closed() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        // Closing the connection abandons an in-flight write
        let sent = tokio::select! {
            biased;
            _ = handle.closed() => break,
            sent = ws_sender.send(msg) => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(conn_id = %handle.id(), error = %e, "WebSocket send failed");
            handle.close(CloseReason::TransportError);
            return;
        }
    }

    if let Some(frame) = handle.close_reason().and_then(|r| r.close_frame()) {
        let _ = timeout(CLOSE_FLUSH_TIMEOUT, ws_sender.send(Message::Close(Some(frame)))).await;
    }
}
