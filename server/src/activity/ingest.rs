//! Normalizes activities from clients and from the store's change feed into a
//! single publish path.
//!
//! Client reports are validated and persisted before anything is broadcast.
//! Records that are already persisted (change feed, CRUD-layer hook) are
//! published as-is. A window of recently published ids makes publication
//! idempotent per store write, since the change feed also observes writes
//! made through the client path.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Activity, ActivityReport, ACTIVITIES_CHANNEL};
use crate::store::{ActivityStore, ChangeEvent, StoreError};
use crate::ws::broadcast::Broadcaster;
use crate::ws::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("Failed to save activity")]
    Persist(#[source] StoreError),
}

/// Bounded set of ids in publication order.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if `id` is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

pub struct ActivityIngestor {
    store: Arc<dyn ActivityStore>,
    broadcaster: Arc<Broadcaster>,
    published: Mutex<RecentIds>,
}

impl ActivityIngestor {
    pub fn new(store: Arc<dyn ActivityStore>, broadcaster: Arc<Broadcaster>, dedupe_window: usize) -> Self {
        Self {
            store,
            broadcaster,
            published: Mutex::new(RecentIds::new(dedupe_window)),
        }
    }

    /// Client path: validate, persist, then publish. Nothing is broadcast
    /// unless the write succeeded.
    pub async fn submit_from_client(
        &self,
        conn_id: &ConnectionId,
        report: ActivityReport,
    ) -> Result<Activity, IngestError> {
        let new = report.validate().map_err(IngestError::Invalid)?;

        let activity = self.store.insert(new).await.map_err(|e| {
            tracing::error!(conn_id = %conn_id, error = %e, "Failed to persist client activity");
            IngestError::Persist(e)
        })?;

        tracing::info!(
            conn_id = %conn_id,
            activity_id = %activity.id,
            kind = %activity.kind,
            "Client activity persisted"
        );
        self.publish(&activity);
        Ok(activity)
    }

    /// Publish an already-persisted activity to the activities room.
    /// Returns `None` if this id was published before.
    pub fn publish(&self, activity: &Activity) -> Option<usize> {
        let fresh = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&activity.id);
        if !fresh {
            tracing::debug!(activity_id = %activity.id, "Activity already published, skipping");
            return None;
        }
        Some(self.broadcaster.broadcast(activity, ACTIVITIES_CHANNEL))
    }

    /// Bridge the store's change feed into [`publish`](Self::publish) until
    /// `shutdown`. A lost feed is re-established after `retry`; client
    /// submissions keep working in the meantime.
    pub async fn run_change_feed(self: Arc<Self>, shutdown: CancellationToken, retry: Duration) {
        'watch: loop {
            let feed = tokio::select! {
                _ = shutdown.cancelled() => break,
                feed = self.store.watch() => feed,
            };

            match feed {
                Ok(mut feed) => {
                    tracing::info!("Change feed connected");
                    loop {
                        let item = tokio::select! {
                            _ = shutdown.cancelled() => break 'watch,
                            item = feed.recv() => item,
                        };
                        match item {
                            Some(Ok(ChangeEvent::Added(activity))) => {
                                if let Some(delivered) = self.publish(&activity) {
                                    tracing::debug!(
                                        activity_id = %activity.id,
                                        delivered,
                                        "Published activity from change feed"
                                    );
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "Change feed error");
                                break;
                            }
                            None => {
                                tracing::warn!("Change feed ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to open change feed"),
            }

            tracing::info!(retry_secs = retry.as_secs(), "Change feed degraded, reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }
        tracing::info!("Change feed stopped");
    }
}
