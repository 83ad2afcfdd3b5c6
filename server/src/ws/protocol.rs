//! JSON wire protocol. Every frame is an object discriminated by `type`.
//! Inbound text frames are decoded into [`ClientMessage`] and dispatched here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::connection::ConnectionHandle;
use crate::activity::{serialize_timestamp, Activity, ActivityReport};
use crate::hub::RealtimeHub;

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
    Activity { data: ActivityReport },
}

impl ClientMessage {
    /// Decode a text frame. The error string is safe to echo to the client.
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid message: {e}"))
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        #[serde(rename = "clientId")]
        client_id: String,
        message: String,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        channel: String,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    Unsubscribed {
        channel: String,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    Pong {
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    RecentActivities {
        data: Vec<Activity>,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    Activity {
        data: Activity,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    Update {
        #[serde(rename = "updateType")]
        update_type: String,
        data: Value,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(serialize_with = "serialize_timestamp")]
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn connection(client_id: &str) -> Self {
        Self::Connection {
            client_id: client_id.to_string(),
            message: "Connected to live activity feed".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn subscribed(channel: &str) -> Self {
        Self::Subscribed {
            channel: channel.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn unsubscribed(channel: &str) -> Self {
        Self::Unsubscribed {
            channel: channel.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn recent_activities(data: Vec<Activity>) -> Self {
        Self::RecentActivities {
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn activity(data: Activity) -> Self {
        Self::Activity {
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn update(update_type: &str, data: Value) -> Self {
        Self::Update {
            update_type: update_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data with string keys
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize server message");
            String::from(r#"{"type":"error","message":"Internal error"}"#)
        })
    }
}

/// Handle an incoming text frame from a connection.
pub async fn handle_text_message(text: &str, handle: &ConnectionHandle, hub: &RealtimeHub) {
    match ClientMessage::parse(text) {
        Ok(message) => dispatch(message, handle, hub).await,
        Err(reason) => {
            tracing::debug!(
                conn_id = %handle.id(),
                "Rejected message: {}",
                text.chars().take(100).collect::<String>()
            );
            reply(hub, handle, ServerMessage::error(reason));
        }
    }
}

async fn dispatch(message: ClientMessage, handle: &ConnectionHandle, hub: &RealtimeHub) {
    match message {
        ClientMessage::Subscribe { channel } => handle_subscribe(channel.trim(), handle, hub).await,
        ClientMessage::Unsubscribe { channel } => handle_unsubscribe(channel.trim(), handle, hub),
        ClientMessage::Ping => reply(hub, handle, ServerMessage::pong()),
        ClientMessage::Activity { data } => handle_activity(data, handle, hub).await,
    }
}

/// Join a room, ack, then replay history for the activities room.
async fn handle_subscribe(channel: &str, handle: &ConnectionHandle, hub: &RealtimeHub) {
    if channel.is_empty() {
        reply(hub, handle, ServerMessage::error("Channel is required"));
        return;
    }

    let joined = hub.registry().subscribe(handle.id(), channel);
    tracing::debug!(conn_id = %handle.id(), channel = %channel, joined, "Subscribe");

    reply(hub, handle, ServerMessage::subscribed(channel));
    hub.backfill().replay(handle, channel).await;
}

fn handle_unsubscribe(channel: &str, handle: &ConnectionHandle, hub: &RealtimeHub) {
    if channel.is_empty() {
        reply(hub, handle, ServerMessage::error("Channel is required"));
        return;
    }

    let left = hub.registry().unsubscribe(handle.id(), channel);
    tracing::debug!(conn_id = %handle.id(), channel = %channel, left, "Unsubscribe");

    reply(hub, handle, ServerMessage::unsubscribed(channel));
}

async fn handle_activity(report: ActivityReport, handle: &ConnectionHandle, hub: &RealtimeHub) {
    if let Err(e) = hub.ingestor().submit_from_client(handle.id(), report).await {
        reply(hub, handle, ServerMessage::error(e.to_string()));
    }
}

/// Send to the originating connection only. A failed send evicts it.
fn reply(hub: &RealtimeHub, handle: &ConnectionHandle, msg: ServerMessage) {
    let _ = hub.broadcaster().send_to(handle, &msg);
}
