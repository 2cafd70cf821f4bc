//! In-process document store.
//!
//! [`MemoryStore`] keeps every collection in memory and publishes a full
//! snapshot to each live subscriber after every mutation of that collection.
//! It can be persisted to a single JSON file, written atomically (temp file,
//! then rename) after every mutation, which makes it usable as a local store
//! for a standalone controller.
//!
//! For tests it supports one-shot fault injection ([`MemoryStore::inject_fault`])
//! and forced subscription failure ([`MemoryStore::fail_subscriptions`]), and
//! records recent successful mutations ([`MemoryStore::mutations`]).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Collection, CollectionPath, Record, Snapshot};
use crate::store::{RemoteStore, Subscription};

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    /// Record creation
    Push,
    /// Field update
    Update,
    /// Record deletion
    Delete,
    /// Opening a live view
    Subscribe,
}

/// A one-shot injected failure.
///
/// The next matching operation fails with [`Error::Store`] (or
/// [`Error::Subscription`] for [`FaultOp::Subscribe`]) and the fault is consumed.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Operation to fail
    pub op: FaultOp,
    /// Only fail operations on this collection; `None` matches any
    pub collection: Option<Collection>,
    /// Error message
    pub message: String,
}

impl Fault {
    /// Fail the next `op` on `collection`
    pub fn on(op: FaultOp, collection: Collection) -> Self {
        Self {
            op,
            collection: Some(collection),
            message: format!("injected {op:?} failure on {collection}"),
        }
    }

    /// Fail the next `op` on any collection
    pub fn any(op: FaultOp) -> Self {
        Self {
            op,
            collection: None,
            message: format!("injected {op:?} failure"),
        }
    }
}

/// Mutations kept by [`MemoryStore::mutations`]; older ones are dropped
pub const MUTATION_LOG_CAPACITY: usize = 1024;

/// A successful mutation, as recorded by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Operation performed
    pub op: FaultOp,
    /// Collection touched
    pub collection: Collection,
    /// Record id
    pub id: String,
}

struct Subscriber {
    id: u64,
    collection: Collection,
    tx: mpsc::UnboundedSender<Result<Snapshot>>,
}

struct Inner {
    /// Collections keyed by rendered path, records keyed by id
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    /// Live views keyed by rendered path
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    faults: Mutex<Vec<Fault>>,
    /// Most recent mutations, oldest dropped first
    mutations: Mutex<VecDeque<Mutation>>,
    next_subscriber: AtomicU64,
    /// JSON file backing the store, if persistent
    persist_path: Option<PathBuf>,
    /// Serializes mutate-then-save so file writes land in mutation order
    persist_lock: TokioMutex<()>,
}

/// In-process document store with live collection views
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty, non-persistent store
    #[must_use]
    pub fn new() -> Self {
        Self::with_contents(HashMap::new(), None)
    }

    /// Open a store persisted at `path`, loading existing contents.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store(format!("failed to create store directory: {e}")))?;
        }

        let contents = if path.exists() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::store(format!("failed to read store file: {e}")))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::store(format!("failed to parse store file: {e}")))?
        } else {
            HashMap::new()
        };

        info!(path = %path.display(), collections = contents.len(), "Local store opened");
        Ok(Self::with_contents(contents, Some(path.to_path_buf())))
    }

    fn with_contents(
        contents: HashMap<String, BTreeMap<String, Value>>,
        persist_path: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(contents),
                subscribers: Mutex::new(HashMap::new()),
                faults: Mutex::new(Vec::new()),
                mutations: Mutex::new(VecDeque::new()),
                next_subscriber: AtomicU64::new(0),
                persist_path,
                persist_lock: TokioMutex::new(()),
            }),
        }
    }

    /// Queue a one-shot failure
    pub fn inject_fault(&self, fault: Fault) {
        debug!(?fault, "Fault injected");
        self.inner.faults.lock().push(fault);
    }

    /// End every live view of `collection` with an error
    pub fn fail_subscriptions(&self, collection: Collection, message: &str) {
        let mut subscribers = self.inner.subscribers.lock();
        for subs in subscribers.values_mut() {
            subs.retain(|sub| {
                if sub.collection == collection {
                    let _ = sub.tx.send(Err(Error::subscription(message)));
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Current contents of a collection
    #[must_use]
    pub fn snapshot(&self, path: &CollectionPath) -> Snapshot {
        let collections = self.inner.collections.read();
        snapshot_of(&collections, &path.to_string())
    }

    /// The last [`MUTATION_LOG_CAPACITY`] successful mutations, oldest first
    #[must_use]
    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.mutations.lock().iter().cloned().collect()
    }

    /// Number of logged mutations of `op` on `collection`
    #[must_use]
    pub fn mutation_count(&self, op: FaultOp, collection: Collection) -> usize {
        self.inner
            .mutations
            .lock()
            .iter()
            .filter(|m| m.op == op && m.collection == collection)
            .count()
    }

    /// Number of live views currently open on `path`
    #[must_use]
    pub fn subscriber_count(&self, path: &CollectionPath) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(&path.to_string())
            .map_or(0, Vec::len)
    }

    fn take_fault(&self, op: FaultOp, collection: Collection) -> Option<Fault> {
        let mut faults = self.inner.faults.lock();
        let pos = faults
            .iter()
            .position(|f| f.op == op && f.collection.map_or(true, |c| c == collection))?;
        Some(faults.remove(pos))
    }

    /// Apply `change` to one collection, persist, then publish the new snapshot.
    async fn mutate<T>(
        &self,
        op: FaultOp,
        path: &CollectionPath,
        change: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<(String, T)>,
    ) -> Result<T> {
        if let Some(fault) = self.take_fault(op, path.collection()) {
            warn!(path = %path, ?op, "Failing operation on injected fault");
            return Err(Error::store(fault.message));
        }

        let _persist_guard = self.inner.persist_lock.lock().await;
        let key = path.to_string();

        // Stage the change on a copy; nothing is visible until it is saved.
        let (id, result, staged, saved) = {
            let mut collections = self.inner.collections.write();
            let mut staged = collections.get(&key).cloned().unwrap_or_default();
            let (id, result) = change(&mut staged)?;
            let saved = if self.inner.persist_path.is_some() {
                let committed = collections.insert(key.clone(), staged);
                let bytes = serde_json::to_vec_pretty(&*collections);
                staged = match committed {
                    Some(records) => collections.insert(key.clone(), records),
                    None => collections.remove(&key),
                }
                .unwrap_or_default();
                Some(bytes.map_err(|e| Error::store(format!("failed to serialize store: {e}")))?)
            } else {
                None
            };
            (id, result, staged, saved)
        };

        if let (Some(bytes), Some(file)) = (saved, self.inner.persist_path.as_deref()) {
            if let Err(e) = save_atomic(file, &bytes).await {
                warn!(path = %path, error = %e, "Store file not written, change discarded");
                return Err(e);
            }
        }

        {
            let mut collections = self.inner.collections.write();
            collections.insert(key.clone(), staged);
            let snapshot = snapshot_of(&collections, &key);
            self.publish(&key, &snapshot);
        }

        let mut mutations = self.inner.mutations.lock();
        if mutations.len() == MUTATION_LOG_CAPACITY {
            mutations.pop_front();
        }
        mutations.push_back(Mutation {
            op,
            collection: path.collection(),
            id,
        });
        Ok(result)
    }

    fn publish(&self, key: &str, snapshot: &Snapshot) {
        let mut subscribers = self.inner.subscribers.lock();
        if let Some(subs) = subscribers.get_mut(key) {
            subs.retain(|sub| sub.tx.send(Ok(snapshot.clone())).is_ok());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn push(&self, path: &CollectionPath, value: Value) -> Result<String> {
        let id = self
            .mutate(FaultOp::Push, path, |records| {
                let id = Uuid::new_v4().simple().to_string();
                records.insert(id.clone(), value);
                Ok((id.clone(), id))
            })
            .await?;
        debug!(path = %path, id = %id, "Record created");
        Ok(id)
    }

    async fn update(&self, path: &CollectionPath, id: &str, fields: Map<String, Value>) -> Result<()> {
        self.mutate(FaultOp::Update, path, |records| {
            let record = records
                .get_mut(id)
                .ok_or_else(|| Error::store(format!("record not found: {path}/{id}")))?;
            match record {
                Value::Object(map) => map.extend(fields),
                other => *other = Value::Object(fields),
            }
            Ok((id.to_string(), ()))
        })
        .await?;
        debug!(path = %path, id, "Record updated");
        Ok(())
    }

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<()> {
        self.mutate(FaultOp::Delete, path, |records| {
            if records.remove(id).is_none() {
                debug!(path = %path, id, "Record doesn't exist, nothing to delete");
            }
            Ok((id.to_string(), ()))
        })
        .await
    }

    async fn subscribe(&self, path: &CollectionPath) -> Result<Subscription> {
        if let Some(fault) = self.take_fault(FaultOp::Subscribe, path.collection()) {
            return Err(Error::subscription(fault.message));
        }

        let key = path.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            // Initial snapshot and registration under the collections lock so
            // no mutation can slip between them.
            let collections = self.inner.collections.read();
            let _ = tx.send(Ok(snapshot_of(&collections, &key)));
            self.inner
                .subscribers
                .lock()
                .entry(key.clone())
                .or_default()
                .push(Subscriber {
                    id,
                    collection: path.collection(),
                    tx,
                });
        }

        debug!(path = %path, subscriber = id, "Live view opened");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(
            rx,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Some(subs) = inner.subscribers.lock().get_mut(&key) {
                        subs.retain(|sub| sub.id != id);
                    }
                    debug!(path = %key, subscriber = id, "Live view closed");
                }
            }),
        ))
    }
}

fn snapshot_of(collections: &HashMap<String, BTreeMap<String, Value>>, key: &str) -> Snapshot {
    collections
        .get(key)
        .map(|records| {
            records
                .iter()
                .map(|(id, data)| Record::new(id.clone(), data.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Write to a temp file, then rename over the target.
async fn save_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");

    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| Error::store(format!("failed to write temp file: {e}")))?;

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| Error::store(format!("failed to rename temp file: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Principal;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn path(collection: Collection) -> CollectionPath {
        CollectionPath::new(&Principal::new("owner").unwrap(), collection)
    }

    #[tokio::test]
    async fn test_push_update_delete() {
        let store = MemoryStore::new();
        let tags = path(Collection::RfidTags);

        let id = store.push(&tags, json!({"uid": "A3", "name": "Mom", "blocked": false})).await.unwrap();
        let mut fields = Map::new();
        fields.insert("blocked".to_string(), json!(true));
        store.update(&tags, &id, fields).await.unwrap();

        let snapshot = store.snapshot(&tags);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].data["blocked"], json!(true));
        assert_eq!(snapshot[0].data["name"], json!("Mom"));

        store.delete(&tags, &id).await.unwrap();
        assert!(store.snapshot(&tags).is_empty());
        // Second delete of the same id is fine
        store.delete(&tags, &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let store = MemoryStore::new();
        let result = store.update(&path(Collection::RfidTags), "nope", Map::new()).await;
        assert!(matches!(result, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_subscription_receives_initial_and_changes() {
        let store = MemoryStore::new();
        let logs = path(Collection::AccessLogs);
        store.push(&logs, json!({"type": "SYSTEM"})).await.unwrap();

        let mut sub = store.subscribe(&logs).await.unwrap();
        let initial = sub.next().await.unwrap().unwrap();
        assert_eq!(initial.len(), 1);

        store.push(&logs, json!({"type": "UNLOCK"})).await.unwrap();
        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.len(), 2);

        // Writes to other collections are not delivered here
        store.push(&path(Collection::Commands), json!({"type": "UNLOCK"})).await.unwrap();
        store.push(&logs, json!({"type": "DENIED"})).await.unwrap();
        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_unregisters_subscriber() {
        let store = MemoryStore::new();
        let tags = path(Collection::RfidTags);
        let mut sub = store.subscribe(&tags).await.unwrap();
        assert_eq!(store.subscriber_count(&tags), 1);
        sub.cancel();
        assert_eq!(store.subscriber_count(&tags), 0);
    }

    #[tokio::test]
    async fn test_injected_fault_is_one_shot() {
        let store = MemoryStore::new();
        let logs = path(Collection::AccessLogs);
        store.inject_fault(Fault::on(FaultOp::Push, Collection::AccessLogs));

        // Other collections are unaffected
        store.push(&path(Collection::Commands), json!({})).await.unwrap();
        assert!(store.push(&logs, json!({})).await.is_err());
        assert!(store.push(&logs, json!({})).await.is_ok());
        assert_eq!(store.mutation_count(FaultOp::Push, Collection::AccessLogs), 1);
        assert_eq!(store.mutation_count(FaultOp::Push, Collection::Commands), 1);
    }

    #[tokio::test]
    async fn test_fail_subscriptions_ends_stream() {
        let store = MemoryStore::new();
        let tags = path(Collection::RfidTags);
        let mut sub = store.subscribe(&tags).await.unwrap();
        let _ = sub.next().await;

        store.fail_subscriptions(Collection::RfidTags, "permission denied");
        assert!(matches!(sub.next().await, Some(Err(Error::Subscription(_)))));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_persistent_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("store.json");
        let tags = path(Collection::RfidTags);

        let id = {
            let store = MemoryStore::open(&file).await.unwrap();
            store.push(&tags, json!({"uid": "A3B4C5", "name": "Mom"})).await.unwrap()
        };

        assert!(!file.with_extension("json.tmp").exists());

        let reopened = MemoryStore::open(&file).await.unwrap();
        let snapshot = reopened.snapshot(&tags);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
        assert_eq!(snapshot[0].data["uid"], json!("A3B4C5"));
    }

    #[tokio::test]
    async fn test_failed_save_discards_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("store.json");
        let commands = path(Collection::Commands);
        let store = MemoryStore::open(&file).await.unwrap();
        let mut sub = store.subscribe(&commands).await.unwrap();
        assert!(sub.next().await.unwrap().unwrap().is_empty());

        // A directory where the temp file goes makes the write fail
        let temp = file.with_extension("json.tmp");
        std::fs::create_dir(&temp).unwrap();
        let result = store.push(&commands, json!({"type": "UNLOCK"})).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert!(store.snapshot(&commands).is_empty());
        assert!(store.mutations().is_empty());
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.next()).await.is_err());

        std::fs::remove_dir(&temp).unwrap();
        store.push(&commands, json!({"type": "UNLOCK"})).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().len(), 1);
        assert_eq!(MemoryStore::open(&file).await.unwrap().snapshot(&commands).len(), 1);
    }

    #[tokio::test]
    async fn test_mutation_log_is_bounded() {
        let store = MemoryStore::new();
        let logs = path(Collection::AccessLogs);
        for _ in 0..MUTATION_LOG_CAPACITY + 10 {
            store.push(&logs, json!({"type": "SYSTEM"})).await.unwrap();
        }

        let mutations = store.mutations();
        assert_eq!(mutations.len(), MUTATION_LOG_CAPACITY);
        assert_eq!(store.snapshot(&logs).len(), MUTATION_LOG_CAPACITY + 10);
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("store.json");
        std::fs::write(&file, b"{not json").unwrap();
        assert!(matches!(MemoryStore::open(&file).await, Err(Error::Store(_))));
    }
}
