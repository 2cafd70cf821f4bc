//! Remote store client interface.
//!
//! The store is an external document store holding one collection per
//! [`CollectionPath`]. Components never touch a global handle; they receive an
//! `Arc<dyn RemoteStore>` when constructed.
//!
//! A live collection view is a [`Subscription`]: a stream of full-collection
//! [`Snapshot`]s (the first one is the current contents) plus a cancel handle.
//! Backends may produce snapshots from change feeds or by polling.
//!
//! Two backends ship with the crate:
//!
//! - [`memory::MemoryStore`]: in-process, optionally persisted to a JSON file,
//!   with fault injection for tests
//! - [`rest::RestStore`]: a realtime-database style REST API, polled

pub mod memory;
pub mod rest;

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{CollectionPath, Snapshot};

pub use memory::{Fault, FaultOp, MemoryStore};
pub use rest::RestStore;

/// Document store reachable over the network
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record; the store assigns and returns its id.
    async fn push(&self, path: &CollectionPath, value: Value) -> Result<String>;

    /// Merge `fields` into an existing record.
    async fn update(&self, path: &CollectionPath, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Delete one record. Deleting a missing record succeeds.
    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<()>;

    /// Open a live view of a collection.
    async fn subscribe(&self, path: &CollectionPath) -> Result<Subscription>;
}

/// Function run once when a subscription is torn down
pub type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// A live collection view.
///
/// Every item on the stream is the full collection at that moment, or the
/// error that ended the view. Dropping the subscription cancels it.
pub struct Subscription {
    snapshots: mpsc::UnboundedReceiver<Result<Snapshot>>,
    cancel: Option<CancelFn>,
}

impl Subscription {
    /// Create a subscription from a snapshot stream and its teardown function
    pub fn new(snapshots: mpsc::UnboundedReceiver<Result<Snapshot>>, cancel: CancelFn) -> Self {
        Self {
            snapshots,
            cancel: Some(cancel),
        }
    }

    /// Wait for the next push. `None` once the view has ended.
    pub async fn next(&mut self) -> Option<Result<Snapshot>> {
        self.snapshots.recv().await
    }

    /// Tear the view down. Later calls are no-ops.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.snapshots.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.cancel.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancel_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = calls.clone();
        let mut sub = Subscription::new(
            rx,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sub.cancel();
        sub.cancel();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel::<Result<Snapshot>>();
        let counter = calls.clone();
        let sub = Subscription::new(
            rx,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tx.send(Ok(Vec::new())).is_err());
    }
}
