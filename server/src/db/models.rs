/// Database row types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.
use rusqlite::Row;

/// Row in the activities table. `seq` orders the change feed; `id` is the
/// public identifier handed to clients.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub seq: i64,
    pub id: String,
    pub kind: String,
    pub description: String,
    pub metadata: String,
    pub source: String,
    pub timestamp: String,
}

/// Column list matching `ActivityRow::from_row`.
pub const ACTIVITY_COLUMNS: &str = "seq, id, type, description, metadata, source, timestamp";

impl ActivityRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            description: row.get(3)?,
            metadata: row.get(4)?,
            source: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }
}
