//! The realtime service object: owns the registry, the fan-out path, and the
//! background tasks, with an explicit `start`/`stop` lifecycle driven by the
//! composition root.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::backfill::FeedBackfill;
use crate::activity::ingest::ActivityIngestor;
use crate::activity::Activity;
use crate::config::RealtimeConfig;
use crate::store::ActivityStore;
use crate::ws::broadcast::Broadcaster;
use crate::ws::connection::CloseReason;
use crate::ws::heartbeat::HeartbeatMonitor;
use crate::ws::registry::ConnectionRegistry;

/// Runtime knobs, resolved from [`RealtimeConfig`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub stale_timeout: Duration,
    pub backfill_limit: usize,
    pub outbound_buffer: usize,
    pub change_feed: bool,
    pub change_feed_retry: Duration,
    pub dedupe_window: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for HubSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            stale_timeout: Duration::from_secs(config.stale_timeout_secs),
            backfill_limit: config.backfill_limit,
            outbound_buffer: config.outbound_buffer.max(1),
            change_feed: config.change_feed,
            change_feed_retry: Duration::from_secs(config.change_feed_retry_secs.max(1)),
            dedupe_window: config.dedupe_window,
        }
    }
}

/// Snapshot for the operator stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: HashMap<String, usize>,
}

pub struct RealtimeHub {
    settings: HubSettings,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    ingestor: Arc<ActivityIngestor>,
    backfill: FeedBackfill,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeHub {
    pub fn new(store: Arc<dyn ActivityStore>, settings: HubSettings) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let ingestor = Arc::new(ActivityIngestor::new(
            store.clone(),
            broadcaster.clone(),
            settings.dedupe_window,
        ));
        let backfill = FeedBackfill::new(store, broadcaster.clone(), settings.backfill_limit);

        Arc::new(Self {
            settings,
            registry,
            broadcaster,
            ingestor,
            backfill,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the heartbeat monitor and, if enabled, the change-feed bridge.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.is_shutting_down() {
            tracing::warn!("Realtime hub already started or stopped");
            return;
        }

        let heartbeat = HeartbeatMonitor::new(
            self.registry.clone(),
            self.settings.heartbeat_interval,
            self.settings.stale_timeout,
        );
        tasks.push(tokio::spawn(heartbeat.run(self.shutdown.child_token())));

        if self.settings.change_feed {
            tasks.push(tokio::spawn(self.ingestor.clone().run_change_feed(
                self.shutdown.child_token(),
                self.settings.change_feed_retry,
            )));
        }

        tracing::info!("Realtime hub started");
    }

    /// Stop background tasks and close every connection as a shutdown.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handles = self.registry.all_handles();
        let closed = handles.len();
        for handle in handles {
            self.registry.evict(handle.id(), CloseReason::ServerShutdown);
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Realtime background task failed");
            }
        }

        tracing::info!(closed, "Realtime hub stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Hook for the CRUD layer: publish an activity it already persisted.
    /// Returns the delivered count, or `None` if it was already published.
    pub fn publish(&self, activity: &Activity) -> Option<usize> {
        self.ingestor.publish(activity)
    }

    /// Send an `update` message to every connection.
    pub fn broadcast_update(&self, update_type: &str, data: Value) -> usize {
        self.broadcaster.broadcast_update(update_type, data)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            rooms: self.registry.room_sizes(),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn ingestor(&self) -> &Arc<ActivityIngestor> {
        &self.ingestor
    }

    pub fn backfill(&self) -> &FeedBackfill {
        &self.backfill
    }
}
