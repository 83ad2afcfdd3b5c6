use std::sync::Arc;

use super::ACTIVITIES_CHANNEL;
use crate::store::ActivityStore;
use crate::ws::broadcast::Broadcaster;
use crate::ws::connection::ConnectionHandle;
use crate::ws::protocol::ServerMessage;

/// Replays the most recent activities to a connection that just joined the
/// activities room, as a single `recent_activities` batch.
pub struct FeedBackfill {
    store: Arc<dyn ActivityStore>,
    broadcaster: Arc<Broadcaster>,
    limit: usize,
}

impl FeedBackfill {
    pub fn new(store: Arc<dyn ActivityStore>, broadcaster: Arc<Broadcaster>, limit: usize) -> Self {
        Self {
            store,
            broadcaster,
            limit,
        }
    }

    /// Send history for `channel` if it has any. Returns the number of
    /// records sent. Fetch errors are logged and swallowed: the subscription
    /// stands without history.
    pub async fn replay(&self, handle: &ConnectionHandle, channel: &str) -> usize {
        if channel != ACTIVITIES_CHANNEL || self.limit == 0 {
            return 0;
        }

        let recent = match self.store.recent(self.limit).await {
            Ok(recent) => recent,
            Err(e) => {
                tracing::warn!(conn_id = %handle.id(), error = %e, "Backfill fetch failed");
                return 0;
            }
        };

        let count = recent.len();
        match self
            .broadcaster
            .send_to(handle, &ServerMessage::recent_activities(recent))
        {
            Ok(()) => {
                tracing::debug!(conn_id = %handle.id(), count, "Sent activity backfill");
                count
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Activity, NewActivity};
    use crate::store::{ChangeFeed, MemoryActivityStore, StoreError};
    use crate::ws::registry::tests::register_test_conn;
    use crate::ws::registry::ConnectionRegistry;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use serde_json::{json, Value};

    struct BrokenStore;

    #[async_trait]
    impl ActivityStore for BrokenStore {
        async fn insert(&self, _activity: NewActivity) -> Result<Activity, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn recent(&self, _limit: usize) -> Result<Vec<Activity>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn watch(&self) -> Result<ChangeFeed, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    fn setup(store: Arc<dyn ActivityStore>) -> (Arc<ConnectionRegistry>, FeedBackfill) {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        (registry, FeedBackfill::new(store, broadcaster, 10))
    }

    #[tokio::test]
    async fn sends_at_most_limit_newest_first() {
        let store = Arc::new(MemoryActivityStore::new());
        let base = chrono::Utc::now();
        for i in 0..12 {
            let mut activity = NewActivity::system("guestbook", format!("entry {i}"), json!({}));
            activity.timestamp = base + chrono::Duration::seconds(i);
            store.insert(activity).await.unwrap();
        }
        let (registry, backfill) = setup(store);
        let mut rx = register_test_conn(&registry, "a", 8);
        let handle = registry.handle(&"a".to_string()).unwrap();

        assert_eq!(backfill.replay(&handle, ACTIVITIES_CHANNEL).await, 10);

        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected a text frame");
        };
        let msg: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(msg["type"], "recent_activities");
        let data = msg["data"].as_array().unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data[0]["description"], "entry 11");
        assert_eq!(data[9]["description"], "entry 2");
    }

    #[tokio::test]
    async fn other_channels_get_no_history() {
        let (registry, backfill) = setup(Arc::new(MemoryActivityStore::new()));
        let mut rx = register_test_conn(&registry, "a", 8);
        let handle = registry.handle(&"a".to_string()).unwrap();

        assert_eq!(backfill.replay(&handle, "photos").await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_is_not_fatal() {
        let (registry, backfill) = setup(Arc::new(BrokenStore));
        let mut rx = register_test_conn(&registry, "a", 8);
        let a = "a".to_string();
        registry.subscribe(&a, ACTIVITIES_CHANNEL);
        let handle = registry.handle(&a).unwrap();

        assert_eq!(backfill.replay(&handle, ACTIVITIES_CHANNEL).await, 0);
        assert!(rx.try_recv().is_err());
        assert!(registry.members_of(ACTIVITIES_CHANNEL).contains(&a));
    }
}
