//! Persistence collaborator for the activity feed.
//!
//! The realtime core only needs three things from the document store: write a
//! record, read the most recent records, and follow a feed of records added by
//! anyone. [`ActivityStore`] captures that contract; [`SqliteActivityStore`] is
//! the production backend and [`MemoryActivityStore`] an in-process one.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::activity::{Activity, NewActivity};

pub use memory::MemoryActivityStore;
pub use sqlite::SqliteActivityStore;

/// Notification yielded by a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(Activity),
}

/// Receiving end of a change feed. A `None` or an `Err` item means the feed
/// has been lost and must be re-established with [`ActivityStore::watch`].
pub type ChangeFeed = mpsc::Receiver<Result<ChangeEvent, StoreError>>;

/// Capacity of a change-feed channel.
pub const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt activity record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("change feed lagged, {0} notifications lost")]
    Lagged(u64),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Persist a new activity and return it with its assigned id.
    async fn insert(&self, activity: NewActivity) -> Result<Activity, StoreError>;

    /// Up to `limit` activities, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Activity>, StoreError>;

    /// Follow activities added after this call.
    async fn watch(&self) -> Result<ChangeFeed, StoreError>;
}
