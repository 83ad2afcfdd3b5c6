//! SQLite-backed activity store.
//!
//! The change feed polls the `activities` table by `seq`, so rows written by
//! other processes (the CRUD layer, admin scripts) are picked up the same way
//! as rows written through [`ActivityStore::insert`]. A re-opened feed
//! resumes after the last row the previous one delivered.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::mpsc;

use super::{ActivityStore, ChangeEvent, ChangeFeed, StoreError, CHANGE_FEED_CAPACITY};
use crate::activity::{format_timestamp, Activity, ActivitySource, NewActivity, UnknownSource};
use crate::db::models::{ActivityRow, ACTIVITY_COLUMNS};
use crate::db::DbPool;

/// Rows fetched per poll.
const FEED_BATCH: i64 = 100;

/// Shortest poll period accepted; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct SqliteActivityStore {
    db: DbPool,
    poll_interval: Duration,
    // Last seq handed to a change feed, shared by clones
    resume_from: Arc<Mutex<Option<i64>>>,
}

impl SqliteActivityStore {
    pub fn new(db: DbPool, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            resume_from: Arc::new(Mutex::new(None)),
        }
    }

    fn resume_point(&self) -> Option<i64> {
        *self.resume_from.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_resume_point(&self, seq: i64) {
        *self.resume_from.lock().unwrap_or_else(PoisonError::into_inner) = Some(seq);
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&conn)
        })
        .await?
    }
}

/// Insert one activity row under the given id. Returns the row's `seq`.
pub fn write_activity(conn: &Connection, id: &str, activity: &NewActivity) -> Result<i64, StoreError> {
    let metadata = activity.metadata.to_string();
    conn.execute(
        "INSERT INTO activities (id, type, description, metadata, source, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id,
            activity.kind,
            activity.description,
            metadata,
            activity.source.as_str(),
            format_timestamp(&activity.timestamp),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn recent_rows(conn: &Connection, limit: usize) -> Result<Vec<ActivityRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities ORDER BY timestamp DESC, seq DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![limit as i64], ActivityRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn rows_after(conn: &Connection, seq: i64) -> Result<Vec<ActivityRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![seq, FEED_BATCH], ActivityRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn max_seq(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM activities", [], |row| row.get(0))?)
}

impl TryFrom<ActivityRow> for Activity {
    type Error = StoreError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };

        let source: ActivitySource = row
            .source
            .parse()
            .map_err(|e: UnknownSource| corrupt(e.to_string()))?;
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| corrupt(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);
        let metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| corrupt(format!("bad metadata: {e}")))?;

        Ok(Activity {
            id: row.id,
            kind: row.kind,
            description: row.description,
            metadata,
            timestamp,
            source,
        })
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn insert(&self, activity: NewActivity) -> Result<Activity, StoreError> {
        self.with_conn(move |conn| {
            let id = uuid::Uuid::new_v4().to_string();
            write_activity(conn, &id, &activity)?;
            Ok(activity.into_activity(id))
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Activity>, StoreError> {
        self.with_conn(move |conn| {
            recent_rows(conn, limit)?
                .into_iter()
                .map(Activity::try_from)
                .collect()
        })
        .await
    }

    async fn watch(&self) -> Result<ChangeFeed, StoreError> {
        let mut cursor = match self.resume_point() {
            Some(seq) => seq,
            None => self.with_conn(max_seq).await?,
        };
        self.set_resume_point(cursor);
        let (tx, rx) = mpsc::channel(CHANGE_FEED_CAPACITY);
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }

                let rows = match store.with_conn(move |conn| rows_after(conn, cursor)).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        // The watcher reconnects; this feed is done
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                };

                for row in rows {
                    let seq = row.seq;
                    match Activity::try_from(row) {
                        Ok(activity) => {
                            // Undelivered rows stay ahead of the resume point
                            if tx.send(Ok(ChangeEvent::Added(activity))).await.is_err() {
                                return;
                            }
                        }
                        // One bad row should not kill the feed
                        Err(e) => tracing::warn!(error = %e, "Skipping unreadable activity row"),
                    }
                    cursor = seq;
                    store.set_resume_point(seq);
                }
            }
        });

        Ok(rx)
    }
}
