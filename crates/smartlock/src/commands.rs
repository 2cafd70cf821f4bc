//! Command and audit writer.
//!
//! Every mutation the client performs goes through [`CommandWriter`]:
//!
//! - [`issue_unlock`](CommandWriter::issue_unlock) writes an unlock command,
//!   then an access log entry, then mirrors the event to the audit sink.
//! - enrollment writes one key or pattern record plus a sink event.
//! - toggles are a single `blocked` field update.
//! - deletes are two-phase: [`request_delete`](CommandWriter::request_delete)
//!   hands out a [`ConfirmationToken`], and only
//!   [`confirm_delete`](CommandWriter::confirm_delete) with that token writes.
//!
//! Multi-step operations are sequences of independent writes. Nothing is
//! rolled back: if the log write fails after the command write succeeded, the
//! command has still been sent and the caller only sees the failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    now_millis, AccessKey, Collection, CollectionPath, Command, CommandType, KnockPattern,
    LogEntry, LogType, Principal,
};
use crate::recorder::RecordedPattern;
use crate::sink::{AuditSink, SinkEvent};
use crate::store::RemoteStore;

/// Detail text of the log entry written by a remote unlock
pub const UNLOCK_DETAIL: &str = "Remote unlock via App";

/// Something a confirmation token can delete
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeleteTarget {
    /// An enrolled RFID tag, by id
    Key(String),
    /// An enrolled knock pattern, by id
    Pattern(String),
}

impl DeleteTarget {
    /// Collection the target lives in
    #[must_use]
    pub const fn collection(&self) -> Collection {
        match self {
            Self::Key(_) => Collection::RfidTags,
            Self::Pattern(_) => Collection::KnockPatterns,
        }
    }

    /// Record id of the target
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Key(id) | Self::Pattern(id) => id,
        }
    }

    /// Question to put to the user before deleting
    #[must_use]
    pub const fn prompt(&self) -> &'static str {
        match self {
            Self::Key(_) => "Permanently delete this key?",
            Self::Pattern(_) => "Delete this knock pattern?",
        }
    }
}

impl fmt::Display for DeleteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection(), self.id())
    }
}

/// Proof that the user was asked before a delete.
///
/// Tokens are single use and expire; see [`CommandWriter::confirm_delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationToken {
    id: Uuid,
    target: DeleteTarget,
    expires_at: Instant,
}

impl ConfirmationToken {
    /// Token identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// What confirming this token deletes
    #[must_use]
    pub fn target(&self) -> &DeleteTarget {
        &self.target
    }

    /// Question to show the user
    #[must_use]
    pub fn prompt(&self) -> &'static str {
        self.target.prompt()
    }

    /// Whether the token can no longer be confirmed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug)]
struct PendingDelete {
    principal: Principal,
    target: DeleteTarget,
    expires_at: Instant,
}

/// Performs every store write on behalf of the client
pub struct CommandWriter {
    store: Arc<dyn RemoteStore>,
    sink: Arc<dyn AuditSink>,
    command_source: String,
    confirm_ttl: Duration,
    pending: Mutex<HashMap<Uuid, PendingDelete>>,
}

impl CommandWriter {
    /// Create a writer
    pub fn new(
        store: Arc<dyn RemoteStore>,
        sink: Arc<dyn AuditSink>,
        command_source: impl Into<String>,
        confirm_ttl: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            command_source: command_source.into(),
            confirm_ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Origin tag written on commands and sink events
    #[must_use]
    pub fn command_source(&self) -> &str {
        &self.command_source
    }

    /// Send a remote unlock.
    ///
    /// Writes the command, then the `UNLOCK` log entry, then mirrors the entry
    /// to the audit sink. The first failing write aborts the sequence and is
    /// returned; earlier writes stay in place.
    pub async fn issue_unlock(&self, principal: &Principal) -> Result<()> {
        let command = Command {
            kind: CommandType::Unlock,
            timestamp: now_millis(),
            source: self.command_source.clone(),
        };
        self.store
            .push(&CollectionPath::new(principal, Collection::Commands), to_value(&command)?)
            .await?;
        debug!(principal = %principal, "Unlock command written");

        let entry = LogEntry {
            id: String::new(),
            kind: LogType::Unlock,
            detail: UNLOCK_DETAIL.to_string(),
            timestamp: Some(now_millis()),
        };
        self.store
            .push(&CollectionPath::new(principal, Collection::AccessLogs), to_value(&entry)?)
            .await?;

        self.sink.emit(SinkEvent::Log {
            kind: LogType::Unlock,
            detail: UNLOCK_DETAIL.to_string(),
            source: self.command_source.clone(),
        });
        info!(principal = %principal, "Remote unlock issued");
        Ok(())
    }

    /// Enroll an RFID tag. Returns the new record id.
    pub async fn enroll_key(&self, principal: &Principal, uid: &str, name: &str) -> Result<String> {
        let uid = uid.trim();
        let name = name.trim();
        if uid.is_empty() {
            return Err(Error::validation("key uid must not be empty"));
        }
        if name.is_empty() {
            return Err(Error::validation("key name must not be empty"));
        }

        let key = AccessKey {
            id: String::new(),
            uid: uid.to_string(),
            name: name.to_string(),
            blocked: false,
            added_at: Some(now_millis()),
        };
        let id = self
            .store
            .push(&CollectionPath::new(principal, Collection::RfidTags), to_value(&key)?)
            .await?;

        self.sink.emit(SinkEvent::AddTag {
            uid: key.uid,
            name: key.name,
        });
        info!(principal = %principal, id = %id, "Key enrolled");
        Ok(id)
    }

    /// Write a recorded knock pattern. Returns the new record id.
    pub async fn enroll_pattern(&self, principal: &Principal, pattern: RecordedPattern) -> Result<String> {
        if pattern.intervals.is_empty() {
            return Err(Error::validation("pattern too short, tap at least twice"));
        }

        let record = KnockPattern {
            id: String::new(),
            name: pattern.name,
            intervals: pattern.intervals,
            blocked: false,
            created_at: Some(now_millis()),
        };
        let id = self
            .store
            .push(&CollectionPath::new(principal, Collection::KnockPatterns), to_value(&record)?)
            .await?;

        self.sink.emit(SinkEvent::AddPattern {
            name: record.name,
            intervals: record.intervals,
        });
        info!(principal = %principal, id = %id, "Knock pattern enrolled");
        Ok(id)
    }

    /// Flip the `blocked` flag of a key. Returns the value written.
    pub async fn toggle_key_blocked(&self, principal: &Principal, key: &AccessKey) -> Result<bool> {
        self.set_blocked(principal, Collection::RfidTags, &key.id, !key.blocked)
            .await
    }

    /// Flip the `blocked` flag of a pattern. Returns the value written.
    pub async fn toggle_pattern_blocked(
        &self,
        principal: &Principal,
        pattern: &KnockPattern,
    ) -> Result<bool> {
        self.set_blocked(principal, Collection::KnockPatterns, &pattern.id, !pattern.blocked)
            .await
    }

    async fn set_blocked(
        &self,
        principal: &Principal,
        collection: Collection,
        id: &str,
        blocked: bool,
    ) -> Result<bool> {
        let mut fields = Map::new();
        fields.insert("blocked".to_string(), Value::Bool(blocked));
        self.store
            .update(&CollectionPath::new(principal, collection), id, fields)
            .await?;
        info!(collection = %collection, id, blocked, "Blocked flag updated");
        Ok(blocked)
    }

    /// Ask for confirmation before deleting `target`.
    ///
    /// Nothing is written until the returned token is passed to
    /// [`confirm_delete`](Self::confirm_delete).
    pub fn request_delete(&self, principal: &Principal, target: DeleteTarget) -> ConfirmationToken {
        let now = Instant::now();
        let token = ConfirmationToken {
            id: Uuid::new_v4(),
            target: target.clone(),
            expires_at: now + self.confirm_ttl,
        };

        let mut pending = self.pending.lock();
        pending.retain(|_, p| p.expires_at > now);
        pending.insert(
            token.id,
            PendingDelete {
                principal: principal.clone(),
                target,
                expires_at: token.expires_at,
            },
        );
        debug!(token = %token.id, target = %token.target, "Delete confirmation requested");
        token
    }

    /// Perform the delete a token was issued for.
    ///
    /// Fails with [`Error::Confirmation`] and writes nothing when the token is
    /// unknown, cancelled, already used or expired.
    pub async fn confirm_delete(&self, token: &ConfirmationToken) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .remove(&token.id)
            .ok_or_else(|| Error::confirmation("unknown or already used confirmation token"))?;

        if Instant::now() >= pending.expires_at {
            return Err(Error::confirmation("confirmation token expired"));
        }

        let path = CollectionPath::new(&pending.principal, pending.target.collection());
        self.store.delete(&path, pending.target.id()).await?;
        info!(target = %pending.target, "Deleted after confirmation");
        Ok(())
    }

    /// Withdraw a delete request. Returns whether the token was pending.
    pub fn cancel_delete(&self, token: &ConfirmationToken) -> bool {
        let cancelled = self.pending.lock().remove(&token.id).is_some();
        if cancelled {
            debug!(token = %token.id, "Delete request cancelled");
        }
        cancelled
    }

    /// Drop every outstanding delete request.
    pub fn clear_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            warn!(count = pending.len(), "Discarding pending delete requests");
            pending.clear();
        }
    }

    /// Number of outstanding delete requests
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::decode(format!("failed to encode record: {e}")))
}
