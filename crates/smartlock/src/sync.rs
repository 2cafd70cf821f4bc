//! Collection synchronizer.
//!
//! The [`Synchronizer`] keeps three local mirrors (keys, patterns, access log)
//! of the principal's remote collections. Each mirror has its own live view;
//! every push from the store replaces the whole mirror with the delivered
//! contents. Nothing is merged and there is no optimistic local state: writes
//! show up here only once the store echoes them.
//!
//! The access log mirror is re-sorted after every replace, newest first, with
//! entries lacking a timestamp at the end. Keys and patterns keep the order the
//! store delivered.
//!
//! A failed view is logged and leaves its mirror stale; the other two keep
//! updating. Mirrors are owned here. Everything else reads them through
//! [`Mirrors`], which has no public mutators.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::{
    decode_snapshot, AccessKey, Collection, CollectionPath, Entity, KnockPattern, LogEntry,
    Principal,
};
use crate::store::{RemoteStore, Subscription};

/// Collections mirrored locally
pub const MIRRORED: [Collection; 3] = [
    Collection::RfidTags,
    Collection::KnockPatterns,
    Collection::AccessLogs,
];

/// Condition of one mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorHealth {
    /// No live view (no principal attached)
    Detached,
    /// View open, first push not yet received
    Pending,
    /// Receiving pushes
    Live,
    /// View failed; contents are the last push received
    Stale(String),
}

#[derive(Debug, Default)]
struct MirrorState {
    /// Bumped on every attach/detach; pushes from older sessions are dropped
    generation: u64,
    principal: Option<Principal>,
    keys: Vec<AccessKey>,
    patterns: Vec<KnockPattern>,
    logs: Vec<LogEntry>,
    health: HashMap<Collection, MirrorHealth>,
}

/// Read-only view of the local mirrors
#[derive(Debug)]
pub struct Mirrors {
    state: RwLock<MirrorState>,
    revision: watch::Sender<u64>,
}

impl Mirrors {
    fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(MirrorState::default()),
            revision,
        }
    }

    /// Enrolled RFID tags, in store order
    #[must_use]
    pub fn keys(&self) -> Vec<AccessKey> {
        self.state.read().keys.clone()
    }

    /// Enrolled knock patterns, in store order
    #[must_use]
    pub fn patterns(&self) -> Vec<KnockPattern> {
        self.state.read().patterns.clone()
    }

    /// Access log, newest first, undated entries last
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        self.state.read().logs.clone()
    }

    /// Look up a mirrored key
    #[must_use]
    pub fn key(&self, id: &str) -> Option<AccessKey> {
        self.state.read().keys.iter().find(|k| k.id == id).cloned()
    }

    /// Look up a mirrored pattern
    #[must_use]
    pub fn pattern(&self, id: &str) -> Option<KnockPattern> {
        self.state.read().patterns.iter().find(|p| p.id == id).cloned()
    }

    /// Number of mirrored patterns
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.state.read().patterns.len()
    }

    /// Principal the mirrors belong to
    #[must_use]
    pub fn principal(&self) -> Option<Principal> {
        self.state.read().principal.clone()
    }

    /// Condition of one mirror
    #[must_use]
    pub fn health(&self, collection: Collection) -> MirrorHealth {
        self.state
            .read()
            .health
            .get(&collection)
            .cloned()
            .unwrap_or(MirrorHealth::Detached)
    }

    /// Receiver that changes whenever any mirror is replaced or cleared
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current revision counter
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Start a new session; returns its generation.
    fn begin(&self, principal: &Principal) -> u64 {
        let generation = {
            let mut state = self.state.write();
            state.generation += 1;
            state.principal = Some(principal.clone());
            state.keys.clear();
            state.patterns.clear();
            state.logs.clear();
            for collection in MIRRORED {
                state.health.insert(collection, MirrorHealth::Pending);
            }
            state.generation
        };
        self.bump();
        generation
    }

    fn clear(&self) {
        {
            let mut state = self.state.write();
            state.generation += 1;
            state.principal = None;
            state.keys.clear();
            state.patterns.clear();
            state.logs.clear();
            state.health.clear();
        }
        self.bump();
    }

    fn set_health(&self, generation: u64, collection: Collection, health: MirrorHealth) {
        let mut state = self.state.write();
        if state.generation == generation {
            state.health.insert(collection, health);
        }
    }

    /// Replace one mirror with freshly delivered contents.
    fn replace<T: Mirrored>(&self, generation: u64, entities: Vec<T>) -> bool {
        {
            let mut state = self.state.write();
            if state.generation != generation {
                return false;
            }
            T::store_into(&mut state, entities);
            state.health.insert(T::COLLECTION, MirrorHealth::Live);
        }
        self.bump();
        true
    }
}

/// Entities that have a mirror
trait Mirrored: Entity {
    fn store_into(state: &mut MirrorState, entities: Vec<Self>);
}

impl Mirrored for AccessKey {
    fn store_into(state: &mut MirrorState, entities: Vec<Self>) {
        state.keys = entities;
    }
}

impl Mirrored for KnockPattern {
    fn store_into(state: &mut MirrorState, entities: Vec<Self>) {
        state.patterns = entities;
    }
}

impl Mirrored for LogEntry {
    fn store_into(state: &mut MirrorState, mut entities: Vec<Self>) {
        sort_logs(&mut entities);
        state.logs = entities;
    }
}

/// Newest first; missing timestamps count as epoch 0.
pub fn sort_logs(logs: &mut [LogEntry]) {
    logs.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
}

struct Session {
    principal: Principal,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Maintains the three live mirrors for the attached principal
pub struct Synchronizer {
    store: Arc<dyn RemoteStore>,
    mirrors: Arc<Mirrors>,
    session: TokioMutex<Option<Session>>,
}

impl Synchronizer {
    /// Create a synchronizer with no principal attached
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            mirrors: Arc::new(Mirrors::new()),
            session: TokioMutex::new(None),
        }
    }

    /// Shared read-only handle to the mirrors
    #[must_use]
    pub fn mirrors(&self) -> Arc<Mirrors> {
        self.mirrors.clone()
    }

    /// Open the three live views for `principal`.
    ///
    /// Returns `false` without doing anything when `principal` is `None` or
    /// already attached. Attaching a different principal tears the current
    /// views down first. A view that fails to open is logged and its mirror
    /// marked stale; the others are still opened.
    pub async fn attach(&self, principal: Option<&Principal>) -> bool {
        let Some(principal) = principal else {
            debug!("No principal yet, not subscribing");
            return false;
        };

        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.principal == *principal {
                debug!(principal = %principal, "Already attached");
                return false;
            }
        }
        if let Some(old) = session.take() {
            info!(principal = %old.principal, "Detaching previous principal");
            old.abort();
        }

        let generation = self.mirrors.begin(principal);
        let mut tasks = Vec::with_capacity(MIRRORED.len());

        for collection in MIRRORED {
            let path = CollectionPath::new(principal, collection);
            let subscription = match self.store.subscribe(&path).await {
                Ok(sub) => sub,
                Err(e) => {
                    error!(path = %path, error = %e, "Failed to open live view");
                    self.mirrors
                        .set_health(generation, collection, MirrorHealth::Stale(e.to_string()));
                    continue;
                }
            };

            let mirrors = self.mirrors.clone();
            let task = match collection {
                Collection::RfidTags => spawn_mirror::<AccessKey>(subscription, mirrors, generation, path),
                Collection::KnockPatterns => {
                    spawn_mirror::<KnockPattern>(subscription, mirrors, generation, path)
                }
                Collection::AccessLogs => spawn_mirror::<LogEntry>(subscription, mirrors, generation, path),
                Collection::Commands => continue,
            };
            tasks.push(task);
        }

        info!(principal = %principal, views = tasks.len(), "Collection views attached");
        *session = Some(Session {
            principal: principal.clone(),
            tasks,
        });
        true
    }

    /// Tear down every view and clear the mirrors.
    pub async fn detach(&self) {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            info!(principal = %old.principal, "Detaching collection views");
            old.abort();
        }
        self.mirrors.clear();
    }

    /// Principal currently attached
    #[must_use]
    pub fn principal(&self) -> Option<Principal> {
        self.mirrors.principal()
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.abort();
        }
    }
}

fn spawn_mirror<T: Mirrored>(
    mut subscription: Subscription,
    mirrors: Arc<Mirrors>,
    generation: u64,
    path: CollectionPath,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match subscription.next().await {
                Some(Ok(snapshot)) => {
                    let entities = decode_snapshot::<T>(&snapshot);
                    let count = entities.len();
                    if !mirrors.replace(generation, entities) {
                        debug!(path = %path, "Push for a detached session, stopping");
                        break;
                    }
                    debug!(path = %path, records = count, "Mirror replaced");
                }
                Some(Err(e)) => {
                    error!(path = %path, error = %e, "Live view failed, mirror is now stale");
                    mirrors.set_health(generation, T::COLLECTION, MirrorHealth::Stale(e.to_string()));
                    mirrors.bump();
                    break;
                }
                None => {
                    warn!(path = %path, "Live view ended");
                    mirrors.set_health(
                        generation,
                        T::COLLECTION,
                        MirrorHealth::Stale("view ended".to_string()),
                    );
                    mirrors.bump();
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogType;
    use crate::store::{Fault, FaultOp, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    fn owner() -> Principal {
        Principal::new("owner").unwrap()
    }

    async fn wait_until(mirrors: &Mirrors, cond: impl Fn(&Mirrors) -> bool) {
        let mut changes = mirrors.changes();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond(mirrors) {
                changes.changed().await.unwrap();
            }
        })
        .await
        .expect("mirror condition not reached");
    }

    fn log(kind: LogType, timestamp: Option<i64>) -> LogEntry {
        LogEntry {
            id: String::new(),
            kind,
            detail: String::new(),
            timestamp,
        }
    }

    #[test]
    fn test_sort_logs_newest_first_nulls_last() {
        let mut logs = vec![
            log(LogType::System, None),
            log(LogType::Unlock, Some(100)),
            log(LogType::Denied, Some(300)),
            log(LogType::RfidAccess, Some(200)),
        ];
        sort_logs(&mut logs);
        let keys: Vec<Option<i64>> = logs.iter().map(|l| l.timestamp).collect();
        assert_eq!(keys, vec![Some(300), Some(200), Some(100), None]);
    }

    #[tokio::test]
    async fn test_attach_without_principal_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        assert!(!sync.attach(None).await);
        assert_eq!(sync.mirrors().health(Collection::RfidTags), MirrorHealth::Detached);
        assert_eq!(
            store.subscriber_count(&CollectionPath::new(&owner(), Collection::RfidTags)),
            0
        );
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_per_principal() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let principal = owner();
        assert!(sync.attach(Some(&principal)).await);
        assert!(!sync.attach(Some(&principal)).await);

        for collection in MIRRORED {
            assert_eq!(
                store.subscriber_count(&CollectionPath::new(&principal, collection)),
                1
            );
        }
    }

    #[tokio::test]
    async fn test_mirror_is_full_replace() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let principal = owner();
        let tags = CollectionPath::new(&principal, Collection::RfidTags);

        let a = store.push(&tags, json!({"uid": "1", "name": "A"})).await.unwrap();
        sync.attach(Some(&principal)).await;
        let mirrors = sync.mirrors();
        wait_until(&mirrors, |m| m.keys().len() == 1).await;

        let b = store.push(&tags, json!({"uid": "2", "name": "B"})).await.unwrap();
        wait_until(&mirrors, |m| m.keys().len() == 2).await;

        store.delete(&tags, &a).await.unwrap();
        wait_until(&mirrors, |m| m.keys().len() == 1).await;
        let keys = mirrors.keys();
        assert_eq!(keys[0].id, b);
        assert_eq!(mirrors.health(Collection::RfidTags), MirrorHealth::Live);
    }

    #[tokio::test]
    async fn test_log_mirror_sorted_after_push() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let principal = owner();
        let logs = CollectionPath::new(&principal, Collection::AccessLogs);

        store.push(&logs, json!({"type": "SYSTEM", "timestamp": null})).await.unwrap();
        store.push(&logs, json!({"type": "UNLOCK", "timestamp": 10})).await.unwrap();
        store.push(&logs, json!({"type": "DENIED", "timestamp": 30})).await.unwrap();

        sync.attach(Some(&principal)).await;
        let mirrors = sync.mirrors();
        wait_until(&mirrors, |m| m.logs().len() == 3).await;

        let order: Vec<LogType> = mirrors.logs().iter().map(|l| l.kind).collect();
        assert_eq!(order, vec![LogType::Denied, LogType::Unlock, LogType::System]);
    }

    #[tokio::test]
    async fn test_failed_view_leaves_others_running() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let principal = owner();
        let tags = CollectionPath::new(&principal, Collection::RfidTags);
        let patterns = CollectionPath::new(&principal, Collection::KnockPatterns);

        store.push(&tags, json!({"uid": "1", "name": "A"})).await.unwrap();
        sync.attach(Some(&principal)).await;
        let mirrors = sync.mirrors();
        wait_until(&mirrors, |m| m.keys().len() == 1).await;

        store.fail_subscriptions(Collection::RfidTags, "permission denied");
        wait_until(&mirrors, |m| {
            matches!(m.health(Collection::RfidTags), MirrorHealth::Stale(_))
        })
        .await;

        // Stale but present
        store.push(&tags, json!({"uid": "2", "name": "B"})).await.unwrap();
        store
            .push(&patterns, json!({"name": "Double", "intervals": [400, 500]}))
            .await
            .unwrap();
        wait_until(&mirrors, |m| m.pattern_count() == 1).await;
        assert_eq!(mirrors.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_marks_stale() {
        let store = Arc::new(MemoryStore::new());
        store.inject_fault(Fault::on(FaultOp::Subscribe, Collection::AccessLogs));
        let sync = Synchronizer::new(store.clone());
        assert!(sync.attach(Some(&owner())).await);

        let mirrors = sync.mirrors();
        assert!(matches!(mirrors.health(Collection::AccessLogs), MirrorHealth::Stale(_)));
        wait_until(&mirrors, |m| m.health(Collection::RfidTags) == MirrorHealth::Live).await;
    }

    #[tokio::test]
    async fn test_detach_cancels_views_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let principal = owner();
        let tags = CollectionPath::new(&principal, Collection::RfidTags);
        store.push(&tags, json!({"uid": "1", "name": "A"})).await.unwrap();

        sync.attach(Some(&principal)).await;
        let mirrors = sync.mirrors();
        wait_until(&mirrors, |m| m.keys().len() == 1).await;

        sync.detach().await;
        assert!(mirrors.keys().is_empty());
        assert!(sync.principal().is_none());

        // Aborted tasks drop their subscriptions
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.subscriber_count(&tags) > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_switching_principal_replaces_mirrors() {
        let store = Arc::new(MemoryStore::new());
        let sync = Synchronizer::new(store.clone());
        let alice = Principal::new("alice").unwrap();
        let bob = Principal::new("bob").unwrap();
        store
            .push(&CollectionPath::new(&alice, Collection::RfidTags), json!({"uid": "1", "name": "A"}))
            .await
            .unwrap();

        sync.attach(Some(&alice)).await;
        let mirrors = sync.mirrors();
        wait_until(&mirrors, |m| m.keys().len() == 1).await;

        sync.attach(Some(&bob)).await;
        assert_eq!(sync.principal(), Some(bob.clone()));
        wait_until(&mirrors, |m| m.health(Collection::RfidTags) == MirrorHealth::Live).await;
        assert!(mirrors.keys().is_empty());
    }
}
