use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{ActivityStore, ChangeEvent, ChangeFeed, StoreError, CHANGE_FEED_CAPACITY};
use crate::activity::{Activity, NewActivity};

/// In-process activity store. Inserts are visible to every open change feed,
/// the same way a real document store notifies its watchers.
pub struct MemoryActivityStore {
    records: Mutex<Vec<Activity>>,
    added: broadcast::Sender<Activity>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        let (added, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            records: Mutex::new(Vec::new()),
            added,
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryActivityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn insert(&self, activity: NewActivity) -> Result<Activity, StoreError> {
        let activity = activity.into_activity(uuid::Uuid::new_v4().to_string());
        {
            let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
            records.push(activity.clone());
        }
        // No receivers simply means nobody is watching
        let _ = self.added.send(activity.clone());
        Ok(activity)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Activity>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut recent: Vec<Activity> = records.iter().rev().cloned().collect();
        // Stable: equal timestamps keep insertion order (newest first)
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn watch(&self) -> Result<ChangeFeed, StoreError> {
        let mut added = self.added.subscribe();
        let (tx, rx) = mpsc::channel(CHANGE_FEED_CAPACITY);

        tokio::spawn(async move {
            loop {
                let item = match added.recv().await {
                    Ok(activity) => Ok(ChangeEvent::Added(activity)),
                    Err(broadcast::error::RecvError::Lagged(n)) => Err(StoreError::Lagged(n)),
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let lost = item.is_err();
                if tx.send(item).await.is_err() || lost {
                    break;
                }
            }
        });

        Ok(rx)
    }
}
