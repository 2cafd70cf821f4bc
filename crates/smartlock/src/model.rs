//! Records mirrored from, and written to, the remote store.
//!
//! Every collection lives under a single [`Principal`]. The store assigns
//! record ids; ids travel beside the record data (see [`Record`]) and are
//! attached after decoding, so the serialized form never contains them.
//!
//! Timestamps are epoch milliseconds written from the client wall clock.

use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// Current client wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Identity under whose namespace every collection is scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    /// Create a principal, rejecting empty or whitespace-only identifiers
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::validation("principal must not be empty"));
        }
        if id.contains('/') {
            return Err(Error::validation("principal must not contain '/'"));
        }
        Ok(Self(id))
    }

    /// The raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Principal {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote collections scoped under a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Enrolled RFID tags
    RfidTags,
    /// Enrolled knock patterns
    KnockPatterns,
    /// Access history
    AccessLogs,
    /// Write-only device commands
    Commands,
}

impl Collection {
    /// Store path segment for this collection
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RfidTags => "rfid_tags",
            Self::KnockPatterns => "knock_patterns",
            Self::AccessLogs => "access_logs",
            Self::Commands => "commands",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical path of a collection: `users/{principal}/{collection}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    principal: Principal,
    collection: Collection,
}

impl CollectionPath {
    /// Build the path for `collection` under `principal`
    #[must_use]
    pub fn new(principal: &Principal, collection: Collection) -> Self {
        Self {
            principal: principal.clone(),
            collection,
        }
    }

    /// The owning principal
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The collection
    #[must_use]
    pub fn collection(&self) -> Collection {
        self.collection
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "users/{}/{}", self.principal, self.collection)
    }
}

/// A raw record as delivered by the store
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Store-assigned id
    pub id: String,
    /// Record fields
    pub data: Value,
}

impl Record {
    /// Create a record
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Full contents of a collection at one point in time
pub type Snapshot = Vec<Record>;

/// A typed record living in one collection
pub trait Entity: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection the entity lives in
    const COLLECTION: Collection;

    /// Store-assigned id
    fn id(&self) -> &str;

    /// Attach the store-assigned id after decoding
    fn set_id(&mut self, id: String);

    /// Decode one raw record
    fn from_record(record: &Record) -> Result<Self> {
        let mut entity: Self = serde_json::from_value(record.data.clone()).map_err(|e| {
            Error::decode(format!("{} record {}: {e}", Self::COLLECTION, record.id))
        })?;
        entity.set_id(record.id.clone());
        Ok(entity)
    }
}

/// Decode every record of a snapshot, skipping records that do not decode.
pub fn decode_snapshot<T: Entity>(snapshot: &[Record]) -> Vec<T> {
    snapshot
        .iter()
        .filter_map(|record| match T::from_record(record) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(collection = %T::COLLECTION, id = %record.id, error = %e, "Skipping undecodable record");
                None
            }
        })
        .collect()
}

/// An enrolled RFID tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKey {
    /// Store-assigned id
    #[serde(skip)]
    pub id: String,
    /// Identifier printed on or scanned from the card
    pub uid: String,
    /// Display label
    pub name: String,
    /// Sole authorization gate
    #[serde(default)]
    pub blocked: bool,
    /// Creation time
    #[serde(default, deserialize_with = "lenient_millis")]
    pub added_at: Option<i64>,
}

impl Entity for AccessKey {
    const COLLECTION: Collection = Collection::RfidTags;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// An enrolled knock pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnockPattern {
    /// Store-assigned id
    #[serde(skip)]
    pub id: String,
    /// Display label
    pub name: String,
    /// Milliseconds between consecutive taps
    pub intervals: Vec<u64>,
    /// Whether the pattern is disabled
    #[serde(default)]
    pub blocked: bool,
    /// Creation time
    #[serde(default, deserialize_with = "lenient_millis")]
    pub created_at: Option<i64>,
}

impl KnockPattern {
    /// Number of taps that produced this pattern
    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.intervals.len() + 1
    }
}

impl Entity for KnockPattern {
    const COLLECTION: Collection = Collection::KnockPatterns;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Access log entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    /// Remote unlock command
    Unlock,
    /// Door opened with an RFID tag
    RfidAccess,
    /// Door opened with a knock pattern
    KnockAccess,
    /// Access attempt refused
    Denied,
    /// Device or system event
    System,
}

impl LogType {
    /// Wire name of this log type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unlock => "UNLOCK",
            Self::RfidAccess => "RFID_ACCESS",
            Self::KnockAccess => "KNOCK_ACCESS",
            Self::Denied => "DENIED",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable access log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-assigned id
    #[serde(skip)]
    pub id: String,
    /// Entry kind
    #[serde(rename = "type")]
    pub kind: LogType,
    /// Free-text description
    #[serde(default)]
    pub detail: String,
    /// Epoch milliseconds; `None` when the store holds no usable time
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: Option<i64>,
}

impl LogEntry {
    /// Timestamp used for ordering, with missing times sorting as epoch 0
    #[must_use]
    pub fn sort_key(&self) -> i64 {
        self.timestamp.unwrap_or(0)
    }
}

impl Entity for LogEntry {
    const COLLECTION: Collection = Collection::AccessLogs;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// Command kinds understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Open the lock
    Unlock,
}

/// A write-only instruction for the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command kind
    #[serde(rename = "type")]
    pub kind: CommandType,
    /// Epoch milliseconds
    pub timestamp: i64,
    /// Origin tag, e.g. `WEB_APP`
    pub source: String,
}

/// Accept epoch milliseconds as an integer or float, or a
/// `{seconds, nanoseconds}` object; anything else reads as `None`.
fn lenient_millis<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(millis_from_value))
}

#[allow(clippy::cast_possible_truncation)]
fn millis_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Object(map) => {
            let seconds = map.get("seconds").or_else(|| map.get("_seconds"))?.as_i64()?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Some(seconds * 1000 + nanos / 1_000_000)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_principal_rejects_empty() {
        assert!(Principal::new("").is_err());
        assert!(Principal::new("   ").is_err());
        assert!(Principal::new("a/b").is_err());
        assert_eq!(Principal::new("owner").unwrap().as_str(), "owner");
    }

    #[test]
    fn test_collection_path_display() {
        let principal = Principal::new("owner").unwrap();
        let path = CollectionPath::new(&principal, Collection::AccessLogs);
        assert_eq!(path.to_string(), "users/owner/access_logs");
        assert_eq!(
            CollectionPath::new(&principal, Collection::RfidTags).to_string(),
            "users/owner/rfid_tags"
        );
    }

    #[test]
    fn test_access_key_serializes_without_id() {
        let key = AccessKey {
            id: "ignored".to_string(),
            uid: "A3B4C5".to_string(),
            name: "Mom".to_string(),
            blocked: false,
            added_at: Some(1_700_000_000_000),
        };
        let value = serde_json::to_value(&key).unwrap();
        assert_eq!(
            value,
            json!({"uid": "A3B4C5", "name": "Mom", "blocked": false, "addedAt": 1_700_000_000_000_i64})
        );
    }

    #[test]
    fn test_access_key_from_record_defaults_blocked() {
        let record = Record::new("k1", json!({"uid": "A3B4C5", "name": "Mom"}));
        let key = AccessKey::from_record(&record).unwrap();
        assert_eq!(key.id, "k1");
        assert!(!key.blocked);
        assert_eq!(key.added_at, None);
    }

    #[test]
    fn test_log_entry_timestamp_forms() {
        let int = LogEntry::from_record(&Record::new(
            "a",
            json!({"type": "UNLOCK", "detail": "x", "timestamp": 1000}),
        ))
        .unwrap();
        assert_eq!(int.timestamp, Some(1000));

        let null = LogEntry::from_record(&Record::new(
            "b",
            json!({"type": "DENIED", "detail": "x", "timestamp": null}),
        ))
        .unwrap();
        assert_eq!(null.timestamp, None);
        assert_eq!(null.sort_key(), 0);

        let missing =
            LogEntry::from_record(&Record::new("c", json!({"type": "SYSTEM"}))).unwrap();
        assert_eq!(missing.timestamp, None);

        let object = LogEntry::from_record(&Record::new(
            "d",
            json!({"type": "RFID_ACCESS", "timestamp": {"seconds": 2, "nanoseconds": 500_000_000}}),
        ))
        .unwrap();
        assert_eq!(object.timestamp, Some(2500));

        let garbage = LogEntry::from_record(&Record::new(
            "e",
            json!({"type": "KNOCK_ACCESS", "timestamp": "yesterday"}),
        ))
        .unwrap();
        assert_eq!(garbage.timestamp, None);
    }

    #[test]
    fn test_decode_snapshot_skips_bad_records() {
        let snapshot = vec![
            Record::new("good", json!({"name": "Double", "intervals": [400, 500]})),
            Record::new("bad", json!({"name": "Broken"})),
        ];
        let patterns: Vec<KnockPattern> = decode_snapshot(&snapshot);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].id, "good");
        assert_eq!(patterns[0].tap_count(), 3);
    }

    #[test]
    fn test_command_wire_format() {
        let command = Command {
            kind: CommandType::Unlock,
            timestamp: 42,
            source: "WEB_APP".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({"type": "UNLOCK", "timestamp": 42, "source": "WEB_APP"})
        );
    }
}
