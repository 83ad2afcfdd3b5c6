use std::sync::{Arc, OnceLock};

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::ServerMessage;
use super::ConnectionId;

/// Close codes sent to clients. 4xxx codes are application-defined.
pub const CLOSE_SERVER_SHUTDOWN: u16 = 1001;
pub const CLOSE_DELIVERY_FAILED: u16 = 1011;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;
pub const CLOSE_SLOW_CONSUMER: u16 = 4001;

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ServerShutdown,
    HeartbeatTimeout,
    SlowConsumer,
    DeliveryFailed,
    /// The client closed or went away; nothing left to tell it.
    ClientClosed,
    /// The transport broke underneath us.
    TransportError,
}

impl CloseReason {
    /// Close frame to send for this reason, if any.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::ServerShutdown => (CLOSE_SERVER_SHUTDOWN, "Server shutting down"),
            Self::HeartbeatTimeout => (CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout"),
            Self::SlowConsumer => (CLOSE_SLOW_CONSUMER, "Slow consumer"),
            Self::DeliveryFailed => (CLOSE_DELIVERY_FAILED, "Delivery failed"),
            Self::ClientClosed | Self::TransportError => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerShutdown => "server_shutdown",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::DeliveryFailed => "delivery_failed",
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
}

impl DeliveryError {
    /// How a connection that failed delivery should be closed.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Full => CloseReason::SlowConsumer,
            Self::Closed => CloseReason::DeliveryFailed,
        }
    }
}

/// Cloneable sending side of one connection.
///
/// Messages go into a bounded queue drained by the connection's writer task.
/// Sends never wait: a full queue means the client is not keeping up.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            cancel: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Enqueue a raw WebSocket message.
    pub fn try_send(&self, msg: Message) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Serialize and enqueue a protocol message.
    pub fn send(&self, msg: &ServerMessage) -> Result<(), DeliveryError> {
        self.try_send(Message::Text(msg.to_json().into()))
    }

    /// Ask the connection's tasks to shut down. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}
