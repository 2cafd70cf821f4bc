//! Configuration for the smart-lock core.
//!
//! This module provides the [`Config`] struct. Configuration covers the remote
//! store location, the principal, the audit sink, and the timing of polling,
//! pruning, unlock hold and delete confirmation.
//!
//! # Example
//!
//! ```rust
//! use smartlock::Config;
//!
//! // Local store under a directory, fixed principal
//! let config = Config::new("/path/to/storage").with_principal("owner");
//!
//! // Remote REST store with an audit sink
//! let config = Config::new("/path/to/storage")
//!     .with_store_url("https://lock.example.com")
//!     .with_sink_url("https://sink.example.com/exec")
//!     .with_poll_interval_ms(500)
//!     .with_prune_interval(600);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{
    DEFAULT_COMMAND_SOURCE, DEFAULT_CONFIRM_TTL_SECS, DEFAULT_MAX_PATTERNS,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_PRUNE_INTERVAL_SECS, DEFAULT_RETENTION_DAYS,
    DEFAULT_UNLOCK_HOLD_SECS,
};

/// Configuration for a [`SmartLock`](crate::SmartLock) handle.
///
/// # Storage Layout
///
/// When no `store_url` is set the handle uses a local store persisted under
/// `storage_path`:
///
/// ```text
/// {storage_path}/
/// ├── config.toml       # optional configuration file
/// └── store.json        # local document store
/// ```
///
/// # Defaults
///
/// - `store_url`: `None` (local store)
/// - `storage_path`: platform data directory + "smartlock"
/// - `principal`: `None` (must be attached before any write)
/// - `sink_url`: `None` (audit events are dropped)
/// - `poll_interval_ms`: 1000
/// - `prune_interval_secs`: 3600
/// - `retention_days`: 30
/// - `max_patterns`: 5
/// - `unlock_hold_secs`: 5
/// - `confirm_ttl_secs`: 60
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of a REST document store.
    ///
    /// Collections live at `{store_url}/users/{principal}/{collection}.json`.
    /// Set to `None` for the local store.
    pub store_url: Option<String>,

    /// Access token appended as the `auth` query parameter on REST calls.
    pub auth_token: Option<String>,

    /// Directory for the local store and configuration file.
    pub storage_path: PathBuf,

    /// Principal under which every collection is scoped.
    pub principal: Option<String>,

    /// Endpoint of the best-effort audit sink.
    pub sink_url: Option<String>,

    /// Origin tag written on every command.
    pub command_source: String,

    /// Poll interval in milliseconds for the REST live collection view.
    pub poll_interval_ms: u64,

    /// Interval in seconds between scheduled retention sweeps.
    pub prune_interval_secs: u64,

    /// Age in days after which access log entries are pruned.
    pub retention_days: u64,

    /// Maximum number of enrolled knock patterns.
    pub max_patterns: usize,

    /// Seconds the unlock status stays `Unlocked` before reverting to `Locked`.
    pub unlock_hold_secs: u64,

    /// Seconds a delete confirmation token stays valid.
    pub confirm_ttl_secs: u64,
}

impl Config {
    /// Create a new configuration with the given storage path
    #[must_use]
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            store_url: None,
            auth_token: None,
            storage_path: storage_path.into(),
            principal: None,
            sink_url: None,
            command_source: DEFAULT_COMMAND_SOURCE.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            prune_interval_secs: DEFAULT_PRUNE_INTERVAL_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            max_patterns: DEFAULT_MAX_PATTERNS,
            unlock_hold_secs: DEFAULT_UNLOCK_HOLD_SECS,
            confirm_ttl_secs: DEFAULT_CONFIRM_TTL_SECS,
        }
    }

    /// Load a configuration from a TOML file.
    ///
    /// Missing fields take their default values.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall loops or disable the core.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be greater than zero"));
        }
        if self.prune_interval_secs == 0 {
            return Err(Error::config("prune_interval_secs must be greater than zero"));
        }
        if self.retention_days == 0 {
            return Err(Error::config("retention_days must be greater than zero"));
        }
        if self.max_patterns == 0 {
            return Err(Error::config("max_patterns must be greater than zero"));
        }
        if self.principal.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(Error::config("principal must not be empty"));
        }
        Ok(())
    }

    /// Set the REST store URL
    #[must_use]
    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    /// Set the REST auth token
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the principal
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Set the audit sink URL
    #[must_use]
    pub fn with_sink_url(mut self, url: impl Into<String>) -> Self {
        self.sink_url = Some(url.into());
        self
    }

    /// Set the command origin tag
    #[must_use]
    pub fn with_command_source(mut self, source: impl Into<String>) -> Self {
        self.command_source = source.into();
        self
    }

    /// Set the REST poll interval
    #[must_use]
    pub const fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the scheduled prune interval
    #[must_use]
    pub const fn with_prune_interval(mut self, secs: u64) -> Self {
        self.prune_interval_secs = secs;
        self
    }

    /// Set the retention window
    #[must_use]
    pub const fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    /// Set the pattern cap
    #[must_use]
    pub const fn with_max_patterns(mut self, max: usize) -> Self {
        self.max_patterns = max;
        self
    }

    /// Set how long the unlocked status is held
    #[must_use]
    pub const fn with_unlock_hold(mut self, secs: u64) -> Self {
        self.unlock_hold_secs = secs;
        self
    }

    /// Set the delete confirmation lifetime
    #[must_use]
    pub const fn with_confirm_ttl(mut self, secs: u64) -> Self {
        self.confirm_ttl_secs = secs;
        self
    }

    /// Get the default storage path
    #[must_use]
    pub fn default_storage_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smartlock")
    }

    /// Path to the local store file
    #[must_use]
    pub fn store_file_path(&self) -> PathBuf {
        self.storage_path.join("store.json")
    }

    /// Path to the configuration file
    #[must_use]
    pub fn config_file_path(&self) -> PathBuf {
        self.storage_path.join("config.toml")
    }

    /// Poll interval as a duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Prune interval as a duration
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    /// Retention window as a duration
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    /// Unlock hold as a duration
    #[must_use]
    pub fn unlock_hold(&self) -> Duration {
        Duration::from_secs(self.unlock_hold_secs)
    }

    /// Confirmation lifetime as a duration
    #[must_use]
    pub fn confirm_ttl(&self) -> Duration {
        Duration::from_secs(self.confirm_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::default_storage_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.store_url.is_none());
        assert!(config.principal.is_none());
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.max_patterns, 5);
        assert_eq!(config.command_source, "WEB_APP");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test")
            .with_store_url("https://example.com")
            .with_principal("owner")
            .with_poll_interval_ms(250)
            .with_prune_interval(60);

        assert_eq!(config.store_url, Some("https://example.com".to_string()));
        assert_eq!(config.principal, Some("owner".to_string()));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.prune_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_retention_is_thirty_days_in_ms() {
        let config = Config::new("/tmp/test");
        assert_eq!(config.retention().as_millis(), 30 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(Config::new("/tmp").with_poll_interval_ms(0).validate().is_err());
        assert!(Config::new("/tmp").with_prune_interval(0).validate().is_err());
        assert!(Config::new("/tmp").with_retention_days(0).validate().is_err());
        assert!(Config::new("/tmp").with_max_patterns(0).validate().is_err());
        assert!(Config::new("/tmp").with_principal("  ").validate().is_err());
    }

    #[test]
    fn test_config_paths() {
        let config = Config::new("/data/smartlock");
        assert_eq!(config.store_file_path(), PathBuf::from("/data/smartlock/store.json"));
        assert_eq!(config.config_file_path(), PathBuf::from("/data/smartlock/config.toml"));
    }

    #[test]
    fn test_load_toml_with_partial_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "principal = \"owner\"\nretention_days = 7\nsink_url = \"https://sink.test/exec\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.principal.as_deref(), Some("owner"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.max_patterns, 5);
        assert_eq!(config.sink_url.as_deref(), Some("https://sink.test/exec"));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_patterns = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
