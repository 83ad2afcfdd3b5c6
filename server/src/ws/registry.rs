//! Live connections and their room memberships.
//!
//! Connections and rooms share one mutex: a subscribe or an eviction updates
//! the connection's subscription set and the room's member set in the same
//! critical section, so `c ∈ members_of(ch)` iff `ch ∈ get(c).subscriptions`
//! at every observable point. The lock is never held across I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::connection::{CloseReason, ConnectionHandle};
use super::rooms::RoomIndex;
use super::ConnectionId;

/// One live transport session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote_address: Option<SocketAddr>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_liveness: Instant,
    pub subscriptions: HashSet<String>,
    pub handle: ConnectionHandle,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        remote_address: Option<SocketAddr>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            id: handle.id().clone(),
            remote_address,
            user_agent,
            connected_at: Utc::now(),
            last_liveness: Instant::now(),
            subscriptions: HashSet::new(),
            handle,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: RoomIndex,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every mutation leaves both maps consistent before returning, so a
        // poisoned guard still holds valid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, conn: Connection) -> ConnectionId {
        let id = conn.id.clone();
        let total = {
            let mut inner = self.lock();
            inner.connections.insert(id.clone(), conn);
            inner.connections.len()
        };
        tracing::debug!(conn_id = %id, connections = total, "Connection registered");
        id
    }

    /// Remove a connection and purge it from every room it joined. Does not
    /// touch the transport; see [`evict`](Self::evict) for that.
    pub fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        let removed = {
            let mut inner = self.lock();
            let conn = inner.connections.remove(id)?;
            inner.rooms.remove_connection(id, conn.subscriptions.iter());
            conn
        };
        tracing::debug!(
            conn_id = %id,
            rooms = removed.subscriptions.len(),
            "Connection unregistered"
        );
        Some(removed)
    }

    /// Evict a connection with `HeartbeatTimeout` if it has been silent for
    /// longer than `stale_timeout` as of `now`. Liveness is re-read under the
    /// lock, so a `touch` that lands after a [`liveness`](Self::liveness)
    /// snapshot keeps the connection.
    pub fn evict_if_stale(&self, id: &ConnectionId, now: Instant, stale_timeout: Duration) -> bool {
        let evicted = {
            let mut inner = self.lock();
            let stale = inner
                .connections
                .get(id)
                .is_some_and(|c| now.saturating_duration_since(c.last_liveness) > stale_timeout);
            if !stale {
                return false;
            }
            match inner.connections.remove(id) {
                Some(conn) => {
                    inner.rooms.remove_connection(id, conn.subscriptions.iter());
                    conn
                }
                None => return false,
            }
        };
        evicted.handle.close(CloseReason::HeartbeatTimeout);
        tracing::info!(
            conn_id = %id,
            reason = CloseReason::HeartbeatTimeout.as_str(),
            "Connection evicted"
        );
        true
    }

    /// Remove a connection and tell its tasks to close with `reason`.
    /// Returns false if it was already gone.
    pub fn evict(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        match self.remove(id) {
            Some(conn) => {
                conn.handle.close(reason);
                tracing::info!(conn_id = %id, reason = reason.as_str(), "Connection evicted");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.lock().connections.get(id).cloned()
    }

    pub fn handle(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.lock().connections.get(id).map(|c| c.handle.clone())
    }

    /// Record inbound traffic from a connection.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(conn) = self.lock().connections.get_mut(id) {
            conn.last_liveness = Instant::now();
        }
    }

    /// Join a room. Returns true if newly joined; false if already a member
    /// or the connection is unknown.
    pub fn subscribe(&self, id: &ConnectionId, channel: &str) -> bool {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let Some(conn) = connections.get_mut(id) else {
            return false;
        };
        if !conn.subscriptions.insert(channel.to_string()) {
            return false;
        }
        rooms.join(channel, id);
        true
    }

    /// Leave a room. Returns true if the connection was a member.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: &str) -> bool {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let Some(conn) = connections.get_mut(id) else {
            return false;
        };
        if !conn.subscriptions.remove(channel) {
            return false;
        }
        rooms.leave(channel, id);
        true
    }

    pub fn members_of(&self, channel: &str) -> HashSet<ConnectionId> {
        self.lock().rooms.members_of(channel)
    }

    /// Handles of every member of a room, taken in one critical section.
    pub fn member_handles(&self, channel: &str) -> Vec<ConnectionHandle> {
        let inner = self.lock();
        inner
            .rooms
            .members_of(channel)
            .iter()
            .filter_map(|id| inner.connections.get(id).map(|c| c.handle.clone()))
            .collect()
    }

    /// Handles of every registered connection.
    pub fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.lock()
            .connections
            .values()
            .map(|c| c.handle.clone())
            .collect()
    }

    /// (handle, last liveness) pairs for the heartbeat sweep.
    pub fn liveness(&self) -> Vec<(ConnectionHandle, Instant)> {
        self.lock()
            .connections
            .values()
            .map(|c| (c.handle.clone(), c.last_liveness))
            .collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member count per room.
    pub fn room_sizes(&self) -> HashMap<String, usize> {
        self.lock()
            .rooms
            .sizes()
            .map(|(ch, n)| (ch.to_string(), n))
            .collect()
    }

    /// Check the room/subscription invariant in both directions.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let inner = self.lock();
        for (id, conn) in &inner.connections {
            for ch in &conn.subscriptions {
                assert!(inner.rooms.contains(ch, id), "{id} subscribed to {ch} but not a member");
            }
        }
        for (ch, _) in inner.rooms.sizes() {
            for id in inner.rooms.members_of(ch) {
                let conn = inner
                    .connections
                    .get(&id)
                    .unwrap_or_else(|| panic!("{id} in room {ch} but not registered"));
                assert!(conn.subscriptions.contains(ch), "{id} in room {ch} but not subscribed");
            }
        }
    }
}
