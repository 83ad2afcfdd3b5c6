//! Canonical activity records and the client-submitted report shape.
//!
//! An `Activity` is immutable once the store has assigned its id. This module
//! owns the model; the ingest pipeline lives in [`ingest`] and history replay
//! in [`backfill`].

pub mod backfill;
pub mod ingest;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Room every activity is published to.
pub const ACTIVITIES_CHANNEL: &str = "activities";

/// Where an activity entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySource {
    Client,
    System,
}

impl ActivitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown activity source {0:?}")]
pub struct UnknownSource(pub String);

impl FromStr for ActivitySource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "system" => Ok(Self::System),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// A persisted activity. Only the store constructs these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default = "empty_metadata")]
    pub metadata: Value,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub source: ActivitySource,
}

/// An activity that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub kind: String,
    pub description: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
    pub source: ActivitySource,
}

impl NewActivity {
    pub fn system(kind: impl Into<String>, description: impl Into<String>, metadata: Value) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            metadata,
            timestamp: Utc::now(),
            source: ActivitySource::System,
        }
    }

    /// Attach the store-assigned id.
    pub fn into_activity(self, id: String) -> Activity {
        Activity {
            id,
            kind: self.kind,
            description: self.description,
            metadata: self.metadata,
            timestamp: self.timestamp,
            source: self.source,
        }
    }
}

/// Payload of a client `activity` message. Fields default to empty so a
/// structurally valid but incomplete report reaches validation instead of
/// failing to decode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityReport {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ActivityReport {
    /// Check required fields and turn the report into a client activity.
    pub fn validate(self) -> Result<NewActivity, &'static str> {
        let kind = self.kind.trim();
        let description = self.description.trim();
        if kind.is_empty() || description.is_empty() {
            return Err("Activity type and description are required");
        }

        Ok(NewActivity {
            kind: kind.to_string(),
            description: description.to_string(),
            metadata: self.metadata.unwrap_or_else(empty_metadata),
            timestamp: Utc::now(),
            source: ActivitySource::Client,
        })
    }
}

fn empty_metadata() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Millisecond RFC 3339 with a `Z` suffix, so stored values sort lexically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn serialize_timestamp<S: Serializer>(
    ts: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(ts))
}
