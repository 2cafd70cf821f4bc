//! The main smart-lock handle.
//!
//! [`SmartLock`] wires the store client, the collection synchronizer, the
//! command writer, the retention pruner and the pattern recorder together,
//! and owns their lifecycle.
//!
//! # Example
//!
//! ```rust,no_run
//! use smartlock::{Config, SmartLock, UnlockState};
//!
//! # async fn example() -> smartlock::Result<()> {
//! let lock = SmartLock::open(Config::new("/tmp/smartlock").with_principal("owner")).await?;
//!
//! lock.issue_unlock().await?;
//! assert_eq!(lock.unlock_state(), UnlockState::Unlocked);
//!
//! for key in lock.keys() {
//!     println!("{} {} blocked={}", key.uid, key.name, key.blocked);
//! }
//!
//! lock.close().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandWriter, ConfirmationToken, DeleteTarget};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{
    decode_snapshot, AccessKey, Collection, CollectionPath, KnockPattern, LogEntry, Principal,
};
use crate::prune::{PruneReport, RetentionPruner};
use crate::recorder::PatternRecorder;
use crate::sink::{AuditSink, HttpSink, NullSink};
use crate::store::{MemoryStore, RemoteStore, RestStore};
use crate::sync::{MirrorHealth, Mirrors, Synchronizer};

/// Status of the most recent remote unlock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockState {
    /// Idle
    Locked,
    /// Command and log writes in flight
    Unlocking,
    /// Writes succeeded; reverts to `Locked` after the unlock hold
    Unlocked,
    /// A write failed; stays until the next attempt
    Failed(String),
}

impl UnlockState {
    /// Whether this is the failure state
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Moves a pending `Unlocking` to `Failed` if the unlock future is dropped
/// before it settles.
struct UnlockGuard<'a> {
    unlock: &'a watch::Sender<UnlockState>,
    armed: bool,
}

impl UnlockGuard<'_> {
    fn settle(mut self, state: UnlockState) {
        self.armed = false;
        self.unlock.send_replace(state);
    }
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cancelled = self.unlock.send_if_modified(|state| {
            if *state == UnlockState::Unlocking {
                *state = UnlockState::Failed("unlock cancelled".to_string());
                true
            } else {
                false
            }
        });
        if cancelled {
            warn!("Remote unlock cancelled before it completed");
        }
    }
}

/// Internal lifecycle state
enum LockState {
    Running {
        /// Handle to the background prune loop
        prune_handle: Option<JoinHandle<()>>,
        /// Sender to signal shutdown to the prune loop
        shutdown_tx: watch::Sender<bool>,
    },
    Closed,
}

impl std::fmt::Debug for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { .. } => write!(f, "Running"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Handle to one smart-lock controller.
///
/// # Lifecycle
///
/// 1. Open with [`SmartLock::open()`] (or [`SmartLock::open_with()`] to
///    inject a store and sink)
/// 2. Attach a principal with [`SmartLock::sign_in()`], or set one in the config
/// 3. Read mirrors, issue commands, record patterns
/// 4. Close with [`SmartLock::close()`]
///
/// A background task prunes the access log every `prune_interval` while a
/// principal is attached.
pub struct SmartLock {
    config: Config,
    store: Arc<dyn RemoteStore>,
    sync: Synchronizer,
    mirrors: Arc<Mirrors>,
    writer: CommandWriter,
    pruner: Arc<RetentionPruner>,
    recorder: Mutex<PatternRecorder>,
    /// Serializes pattern saves so each one sees the count left by the last
    save_lock: tokio::sync::Mutex<()>,
    unlock: Arc<watch::Sender<UnlockState>>,
    relock_handle: Mutex<Option<JoinHandle<()>>>,
    state: RwLock<LockState>,
}

impl SmartLock {
    /// Open a handle from configuration.
    ///
    /// Uses the REST store when `store_url` is set, otherwise the local store
    /// under `storage_path`. Uses the HTTP audit sink when `sink_url` is set.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn RemoteStore> = match &config.store_url {
            Some(url) => {
                info!(url = %url, "Using REST store");
                Arc::new(RestStore::from_config(&config)?)
            }
            None => Arc::new(MemoryStore::open(&config.store_file_path()).await?),
        };
        let sink: Arc<dyn AuditSink> = match &config.sink_url {
            Some(url) => Arc::new(HttpSink::new(url.clone())),
            None => Arc::new(NullSink),
        };

        Self::open_with(config, store, sink).await
    }

    /// Open a handle over an explicit store and sink.
    pub async fn open_with(
        config: Config,
        store: Arc<dyn RemoteStore>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;

        let sync = Synchronizer::new(store.clone());
        let mirrors = sync.mirrors();
        let writer = CommandWriter::new(
            store.clone(),
            sink,
            config.command_source.clone(),
            config.confirm_ttl(),
        );
        let pruner = Arc::new(RetentionPruner::new(
            store.clone(),
            mirrors.clone(),
            config.retention(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prune_handle = Self::start_prune_loop(pruner.clone(), mirrors.clone(), config.prune_interval(), shutdown_rx);
        let (unlock, _) = watch::channel(UnlockState::Locked);

        let lock = Self {
            store,
            sync,
            mirrors,
            writer,
            pruner,
            recorder: Mutex::new(PatternRecorder::new()),
            save_lock: tokio::sync::Mutex::new(()),
            unlock: Arc::new(unlock),
            relock_handle: Mutex::new(None),
            state: RwLock::new(LockState::Running {
                prune_handle: Some(prune_handle),
                shutdown_tx,
            }),
            config,
        };

        if let Some(principal) = lock.config.principal.as_deref() {
            lock.sign_in(Principal::new(principal)?).await?;
        }

        info!("Smart lock opened");
        Ok(lock)
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the handle is open
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(&*self.state.read(), LockState::Running { .. })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }

    // ========================================================================
    // Principal
    // ========================================================================

    /// Attach `principal` and open its live collection views.
    ///
    /// Returns `false` when it was already attached. Switching principals
    /// drops pending delete requests and any recording in progress.
    pub async fn sign_in(&self, principal: Principal) -> Result<bool> {
        self.ensure_running()?;
        let previous = self.sync.principal();
        let attached = self.sync.attach(Some(&principal)).await;
        if attached && previous.is_some() {
            self.reset_session();
        }
        Ok(attached)
    }

    /// Detach the principal, closing every live view and clearing the mirrors.
    pub async fn sign_out(&self) {
        self.sync.detach().await;
        self.reset_session();
        info!("Signed out");
    }

    fn reset_session(&self) {
        self.pruner.reset();
        self.writer.clear_pending();
        self.recorder.lock().cancel();
    }

    /// Principal currently attached
    #[must_use]
    pub fn principal(&self) -> Option<Principal> {
        self.mirrors.principal()
    }

    fn require_principal(&self) -> Result<Principal> {
        self.ensure_running()?;
        self.mirrors.principal().ok_or(Error::NoPrincipal)
    }

    // ========================================================================
    // Mirrors
    // ========================================================================

    /// Enrolled RFID tags
    #[must_use]
    pub fn keys(&self) -> Vec<AccessKey> {
        self.mirrors.keys()
    }

    /// Enrolled knock patterns
    #[must_use]
    pub fn patterns(&self) -> Vec<KnockPattern> {
        self.mirrors.patterns()
    }

    /// Access log, newest first
    #[must_use]
    pub fn logs(&self) -> Vec<LogEntry> {
        self.mirrors.logs()
    }

    /// Condition of one mirror
    #[must_use]
    pub fn mirror_health(&self, collection: Collection) -> MirrorHealth {
        self.mirrors.health(collection)
    }

    /// Receiver notified whenever a mirror changes
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.mirrors.changes()
    }

    /// Shared read-only handle to the mirrors
    #[must_use]
    pub fn mirrors(&self) -> Arc<Mirrors> {
        self.mirrors.clone()
    }

    // ========================================================================
    // Unlock
    // ========================================================================

    /// Current unlock status
    #[must_use]
    pub fn unlock_state(&self) -> UnlockState {
        self.unlock.borrow().clone()
    }

    /// Receiver for unlock status changes
    #[must_use]
    pub fn watch_unlock(&self) -> watch::Receiver<UnlockState> {
        self.unlock.subscribe()
    }

    /// Send a remote unlock.
    ///
    /// Moves the status to `Unlocking`, then to `Unlocked` when both the command
    /// and the log entry were written, or to `Failed` when either write failed.
    /// `Unlocked` reverts to `Locked` after `unlock_hold`. Rejected while another
    /// unlock is in flight. Dropping the returned future before it settles
    /// leaves the status at `Failed`.
    pub async fn issue_unlock(&self) -> Result<()> {
        let principal = self.require_principal()?;

        let started = self.unlock.send_if_modified(|state| {
            if *state == UnlockState::Unlocking {
                false
            } else {
                *state = UnlockState::Unlocking;
                true
            }
        });
        if !started {
            return Err(Error::validation("an unlock is already in progress"));
        }
        let guard = UnlockGuard {
            unlock: &self.unlock,
            armed: true,
        };
        if let Some(handle) = self.relock_handle.lock().take() {
            handle.abort();
        }

        match self.writer.issue_unlock(&principal).await {
            Ok(()) => {
                guard.settle(UnlockState::Unlocked);
                let unlock = self.unlock.clone();
                let hold = self.config.unlock_hold();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(hold).await;
                    unlock.send_if_modified(|state| {
                        if *state == UnlockState::Unlocked {
                            *state = UnlockState::Locked;
                            true
                        } else {
                            false
                        }
                    });
                });
                *self.relock_handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Remote unlock failed");
                guard.settle(UnlockState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    // ========================================================================
    // Keys and patterns
    // ========================================================================

    /// Enroll an RFID tag. Returns the new record id.
    pub async fn enroll_key(&self, uid: &str, name: &str) -> Result<String> {
        let principal = self.require_principal()?;
        self.writer.enroll_key(&principal, uid, name).await
    }

    /// Flip the `blocked` flag of a mirrored key. Returns the value written.
    pub async fn toggle_key_blocked(&self, id: &str) -> Result<bool> {
        let principal = self.require_principal()?;
        let key = self
            .mirrors
            .key(id)
            .ok_or_else(|| Error::validation(format!("unknown key: {id}")))?;
        self.writer.toggle_key_blocked(&principal, &key).await
    }

    /// Flip the `blocked` flag of a mirrored pattern. Returns the value written.
    pub async fn toggle_pattern_blocked(&self, id: &str) -> Result<bool> {
        let principal = self.require_principal()?;
        let pattern = self
            .mirrors
            .pattern(id)
            .ok_or_else(|| Error::validation(format!("unknown pattern: {id}")))?;
        self.writer.toggle_pattern_blocked(&principal, &pattern).await
    }

    /// Ask for confirmation before deleting a mirrored key or pattern.
    pub fn request_delete(&self, target: DeleteTarget) -> Result<ConfirmationToken> {
        let principal = self.require_principal()?;
        let known = match &target {
            DeleteTarget::Key(id) => self.mirrors.key(id).is_some(),
            DeleteTarget::Pattern(id) => self.mirrors.pattern(id).is_some(),
        };
        if !known {
            return Err(Error::validation(format!("unknown {target}")));
        }
        Ok(self.writer.request_delete(&principal, target))
    }

    /// Perform a confirmed delete.
    pub async fn confirm_delete(&self, token: &ConfirmationToken) -> Result<()> {
        self.ensure_running()?;
        self.writer.confirm_delete(token).await
    }

    /// Withdraw a delete request. Returns whether it was pending.
    pub fn cancel_delete(&self, token: &ConfirmationToken) -> bool {
        self.writer.cancel_delete(token)
    }

    // ========================================================================
    // Pattern recording
    // ========================================================================

    /// Start recording a new knock pattern.
    ///
    /// Rejected once `max_patterns` patterns are enrolled.
    pub fn start_recording(&self) -> Result<()> {
        self.require_principal()?;
        self.check_pattern_cap()?;
        self.recorder.lock().start_recording();
        Ok(())
    }

    /// Record a tap now. Returns `false` when not recording.
    pub fn record_tap(&self) -> bool {
        self.recorder.lock().record_tap()
    }

    /// Record a tap at `millis` since an arbitrary origin.
    pub fn record_tap_at(&self, millis: u64) -> bool {
        self.recorder.lock().record_tap_at(millis)
    }

    /// Whether a recording is in progress
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recorder.lock().is_recording()
    }

    /// Taps in the current recording
    #[must_use]
    pub fn tap_count(&self) -> usize {
        self.recorder.lock().tap_count()
    }

    /// Stop recording and save the pattern as `name`. Returns the new record id.
    ///
    /// Validation failures (too few taps, blank name, cap reached) write nothing.
    /// The cap is checked against a fresh read of the store, not the mirror,
    /// so saves issued back to back cannot overshoot it.
    pub async fn stop_and_save(&self, name: &str) -> Result<String> {
        let principal = self.require_principal()?;
        let pattern = self.recorder.lock().finish(name)?;

        let _saving = self.save_lock.lock().await;
        let count = self.stored_pattern_count(&principal).await?;
        if count >= self.config.max_patterns {
            return Err(self.pattern_cap_error(count));
        }
        self.writer.enroll_pattern(&principal, pattern).await
    }

    /// Stop recording and discard the taps.
    pub fn cancel_recording(&self) {
        self.recorder.lock().cancel();
    }

    fn check_pattern_cap(&self) -> Result<()> {
        let count = self.mirrors.pattern_count();
        if count >= self.config.max_patterns {
            return Err(self.pattern_cap_error(count));
        }
        Ok(())
    }

    fn pattern_cap_error(&self, count: usize) -> Error {
        Error::validation(format!(
            "pattern limit reached ({count} of {})",
            self.config.max_patterns
        ))
    }

    /// Patterns currently in the store, read from a one-off view
    async fn stored_pattern_count(&self, principal: &Principal) -> Result<usize> {
        let path = CollectionPath::new(principal, Collection::KnockPatterns);
        let mut view = self.store.subscribe(&path).await?;
        let snapshot = view
            .next()
            .await
            .ok_or_else(|| Error::subscription(format!("{path}: view closed before first snapshot")))?;
        view.cancel();
        Ok(decode_snapshot::<KnockPattern>(&snapshot?).len())
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Prune access log entries older than the retention window.
    pub async fn prune_old_logs(&self) -> Result<PruneReport> {
        self.require_principal()?;
        self.pruner.prune_old_logs().await
    }

    /// Open the log view: prune once, then return the log mirror.
    pub async fn open_log_view(&self) -> Result<Vec<LogEntry>> {
        let report = self.prune_old_logs().await?;
        debug!(?report, "Log view opened");
        Ok(self.mirrors.logs())
    }

    fn start_prune_loop(
        pruner: Arc<RetentionPruner>,
        mirrors: Arc<Mirrors>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Background prune loop started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Prune loop received shutdown signal");
                            break;
                        }
                    }
                    () = tokio::time::sleep(interval) => {
                        if mirrors.principal().is_none() {
                            debug!("No principal attached, skipping scheduled prune");
                            continue;
                        }
                        if let Err(e) = pruner.prune_old_logs().await {
                            warn!(error = %e, "Scheduled prune failed");
                        }
                    }
                }
            }

            info!("Background prune loop stopped");
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the handle: stop the prune loop and tear down every live view.
    pub async fn close(&self) -> Result<()> {
        info!("Closing smart lock");

        let (prune_handle, shutdown_tx) = {
            let mut state = self.state.write();
            match std::mem::replace(&mut *state, LockState::Closed) {
                LockState::Running {
                    prune_handle,
                    shutdown_tx,
                } => (prune_handle, shutdown_tx),
                LockState::Closed => {
                    debug!("Smart lock already closed");
                    return Ok(());
                }
            }
        };

        if shutdown_tx.send(true).is_err() {
            debug!("Prune loop already stopped (receiver dropped)");
        }

        if let Some(handle) = prune_handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => debug!("Prune loop stopped gracefully"),
                Ok(Err(e)) => warn!("Prune loop task panicked: {e}"),
                Err(_) => warn!("Prune loop did not stop within timeout"),
            }
        }

        if let Some(handle) = self.relock_handle.lock().take() {
            handle.abort();
        }
        self.sync.detach().await;
        self.reset_session();

        info!("Smart lock closed");
        Ok(())
    }
}

impl std::fmt::Debug for SmartLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartLock")
            .field("principal", &self.principal())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}
