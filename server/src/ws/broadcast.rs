use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::ws::Message;
use serde_json::Value;

use super::connection::{ConnectionHandle, DeliveryError};
use super::protocol::ServerMessage;
use super::registry::ConnectionRegistry;
use crate::activity::Activity;

/// Fans messages out to room members or to every connection.
///
/// A failed enqueue evicts only the connection it failed on; the fan-out
/// always reaches the remaining members.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    // Serializes fan-outs so each member sees broadcasts in call order
    fanout: Mutex<()>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            fanout: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Push an activity to every member of `channel`. Returns the number of
    /// connections it was delivered to.
    pub fn broadcast(&self, activity: &Activity, channel: &str) -> usize {
        let frame = ServerMessage::activity(activity.clone()).to_json();
        let delivered = self.fan_out(frame, || self.registry.member_handles(channel));
        tracing::debug!(
            activity_id = %activity.id,
            channel = %channel,
            delivered,
            "Broadcast activity"
        );
        delivered
    }

    /// Push an `update` message to every connection regardless of rooms.
    pub fn broadcast_update(&self, update_type: &str, data: Value) -> usize {
        let frame = ServerMessage::update(update_type, data).to_json();
        let delivered = self.fan_out(frame, || self.registry.all_handles());
        tracing::debug!(update_type = %update_type, delivered, "Broadcast update");
        delivered
    }

    /// Send one message to one connection, evicting it on failure.
    pub fn send_to(&self, handle: &ConnectionHandle, msg: &ServerMessage) -> Result<(), DeliveryError> {
        handle.send(msg).inspect_err(|e| self.evict_failed(handle, *e))
    }

    fn fan_out(&self, frame: String, recipients: impl FnOnce() -> Vec<ConnectionHandle>) -> usize {
        let msg = Message::Text(frame.into());
        let mut failed = Vec::new();
        let mut delivered = 0;
        {
            let _order = self.fanout.lock().unwrap_or_else(PoisonError::into_inner);
            for handle in recipients() {
                match handle.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((handle, e)),
                }
            }
        }

        for (handle, e) in failed {
            self.evict_failed(&handle, e);
        }
        delivered
    }

    fn evict_failed(&self, handle: &ConnectionHandle, e: DeliveryError) {
        tracing::warn!(conn_id = %handle.id(), error = %e, "Delivery failed, evicting connection");
        self.registry.evict(handle.id(), e.close_reason());
    }
}
