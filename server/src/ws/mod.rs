pub mod actor;
pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod rooms;

/// Opaque per-connection id, generated at accept time.
pub type ConnectionId = String;

/// Generate a fresh connection id.
pub fn new_connection_id() -> ConnectionId {
    uuid::Uuid::new_v4().to_string()
}
