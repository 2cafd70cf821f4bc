//! # smartlock - State synchronization and command core for a smart lock
//!
//! A smart lock authorizes entry three ways: a remote unlock command, an RFID
//! tag, or a knock pattern. This crate is the client-side core behind a
//! control dashboard for such a lock. It keeps live local mirrors of the
//! lock's remote state, writes commands and audit records through a shared
//! document store, records new knock patterns, and keeps the access log
//! inside a rolling retention window.
//!
//! ## Features
//!
//! - **Live mirrors**: enrolled keys, knock patterns and the access log, each
//!   fully replaced on every store push. Writes show up once the store echoes them.
//! - **Remote unlock**: command plus access log entry, with an observable
//!   unlock status that ends in a distinct failed state on a partial write.
//! - **Two-phase deletes**: nothing is deleted without a confirmation token.
//! - **Pattern recording**: tap timing turned into the stored interval encoding.
//! - **Retention**: scheduled, idempotent pruning of old access log entries.
//! - **Pluggable store**: a persistent local store or a REST document store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smartlock::{Config, DeleteTarget, SmartLock};
//!
//! #[tokio::main]
//! async fn main() -> smartlock::Result<()> {
//!     let config = Config::new("/path/to/storage").with_principal("owner");
//!     let lock = SmartLock::open(config).await?;
//!
//!     // Remote unlock
//!     lock.issue_unlock().await?;
//!
//!     // Enroll and block a key
//!     let id = lock.enroll_key("A3B4C5", "Mom").await?;
//!     // ...once the mirror has the new key:
//!     lock.toggle_key_blocked(&id).await?;
//!
//!     // Deletes need confirmation
//!     let token = lock.request_delete(DeleteTarget::Key(id))?;
//!     println!("{}", token.prompt());
//!     lock.confirm_delete(&token).await?;
//!
//!     // Record a knock pattern
//!     lock.start_recording()?;
//!     lock.record_tap_at(0);
//!     lock.record_tap_at(400);
//!     lock.record_tap_at(900);
//!     lock.stop_and_save("Double").await?;
//!
//!     lock.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Configuration for the [`SmartLock`] handle
//! - [`error`]: Error types and Result alias
//! - [`model`]: Records stored in the remote collections
//! - [`store`]: Remote store interface and its local and REST backends
//! - [`sync`]: Collection synchronizer and the read-only mirrors
//! - [`commands`]: Unlock, enrollment, toggle and confirmed delete writes
//! - [`prune`]: Access log retention
//! - [`recorder`]: Knock pattern recording
//! - [`sink`]: Best-effort external audit sink
//! - [`lock`]: Main [`SmartLock`] handle

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]

// =============================================================================
// Public modules
// =============================================================================

pub mod commands;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod prune;
pub mod recorder;
pub mod sink;
pub mod store;
pub mod sync;

// =============================================================================
// Public re-exports
// =============================================================================

pub use commands::{CommandWriter, ConfirmationToken, DeleteTarget};
pub use config::Config;
pub use error::{Error, Result};
pub use lock::{SmartLock, UnlockState};
pub use model::{
    AccessKey, Collection, CollectionPath, Command, CommandType, KnockPattern, LogEntry, LogType,
    Principal,
};
pub use prune::{PruneReport, RetentionPruner};
pub use recorder::{PatternRecorder, RecordedPattern};
pub use sink::{AuditSink, HttpSink, NullSink, SinkEvent};
pub use store::{MemoryStore, RemoteStore, RestStore, Subscription};
pub use sync::{MirrorHealth, Mirrors, Synchronizer};

// =============================================================================
// Constants
// =============================================================================

/// Default origin tag written on commands and audit events.
pub const DEFAULT_COMMAND_SOURCE: &str = "WEB_APP";

/// Default poll interval for REST live views, in milliseconds.
///
/// Can be configured via [`Config::with_poll_interval_ms`].
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default interval between scheduled retention sweeps, in seconds.
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 3600;

/// Default access log retention window, in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Default maximum number of enrolled knock patterns.
pub const DEFAULT_MAX_PATTERNS: usize = 5;

/// Default time the unlock status stays `Unlocked`, in seconds.
pub const DEFAULT_UNLOCK_HOLD_SECS: u64 = 5;

/// Default lifetime of a delete confirmation token, in seconds.
pub const DEFAULT_CONFIRM_TTL_SECS: u64 = 60;
