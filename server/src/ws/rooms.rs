use std::collections::{HashMap, HashSet};

use super::ConnectionId;

/// Channel name -> member connection ids.
///
/// Not synchronized on its own: it lives inside the registry's critical
/// section so room membership and per-connection subscription sets change
/// together.
#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RoomIndex {
    /// Add a member, creating the room on first join. Returns false if it
    /// was already a member.
    pub fn join(&mut self, channel: &str, conn_id: &ConnectionId) -> bool {
        self.rooms
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id.clone())
    }

    /// Remove a member, deleting the room once it is empty. Returns false
    /// if it was not a member.
    pub fn leave(&mut self, channel: &str, conn_id: &ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(conn_id);
        if members.is_empty() {
            self.rooms.remove(channel);
        }
        removed
    }

    /// Remove a connection from the given rooms. The caller passes the
    /// connection's own subscription set, so no scan over all rooms.
    pub fn remove_connection<'a>(&mut self, conn_id: &ConnectionId, channels: impl IntoIterator<Item = &'a String>) {
        for channel in channels {
            self.leave(channel, conn_id);
        }
    }

    pub fn members_of(&self, channel: &str) -> HashSet<ConnectionId> {
        self.rooms.get(channel).cloned().unwrap_or_default()
    }

    pub fn contains(&self, channel: &str, conn_id: &ConnectionId) -> bool {
        self.rooms
            .get(channel)
            .is_some_and(|members| members.contains(conn_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// (channel, member count) for every live room.
    pub fn sizes(&self) -> impl Iterator<Item = (&str, usize)> {
        self.rooms.iter().map(|(ch, m)| (ch.as_str(), m.len()))
    }
}
