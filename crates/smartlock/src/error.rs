//! Error types for the smart-lock core.
//!
//! This module defines the [`enum@Error`] enum and [`Result`] type alias used
//! throughout the crate.
//!
//! # Error Categories
//!
//! - [`Error::Validation`] - user-correctable input problems, detected locally
//!   before any network call (empty name, pattern too short, pattern cap)
//! - [`Error::NoPrincipal`] - an operation needed a principal and none is attached
//! - [`Error::Store`] - a remote store write, update or delete failed
//! - [`Error::Subscription`] - a live collection view failed
//! - [`Error::Decode`] - a record delivered by the store could not be decoded
//! - [`Error::Confirmation`] - a delete confirmation token was unknown or expired
//! - [`Error::Config`] - configuration issues
//! - [`Error::Shutdown`] - operation on a closed handle
//!
//! Audit sink failures never surface here; the sink only logs them.
//!
//! # Example
//!
//! ```rust,no_run
//! use smartlock::{Config, Error, SmartLock};
//!
//! # async fn example() -> smartlock::Result<()> {
//! let lock = SmartLock::open(Config::default()).await?;
//!
//! match lock.enroll_key("", "Mom").await {
//!     Ok(id) => println!("enrolled {id}"),
//!     Err(Error::Validation(msg)) => eprintln!("fix your input: {msg}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for smart-lock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in smart-lock operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Input rejected locally; nothing was written
    #[error("validation failed: {0}")]
    Validation(Arc<str>),

    /// No principal is attached
    #[error("no principal attached")]
    NoPrincipal,

    /// Remote store operation failed
    #[error("store error: {0}")]
    Store(Arc<str>),

    /// Live collection view failed
    #[error("subscription error: {0}")]
    Subscription(Arc<str>),

    /// Store record could not be decoded
    #[error("decode error: {0}")]
    Decode(Arc<str>),

    /// Delete confirmation token rejected
    #[error("confirmation failed: {0}")]
    Confirmation(Arc<str>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Arc<str>),

    /// The handle has been closed
    #[error("smart-lock handle has been closed")]
    Shutdown,
}

impl Error {
    /// Create a validation error
    #[inline]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(Arc::from(msg.into()))
    }

    /// Create a store error
    #[inline]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(Arc::from(msg.into()))
    }

    /// Create a subscription error
    #[inline]
    pub fn subscription(msg: impl Into<String>) -> Self {
        Self::Subscription(Arc::from(msg.into()))
    }

    /// Create a decode error
    #[inline]
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(Arc::from(msg.into()))
    }

    /// Create a confirmation error
    #[inline]
    pub fn confirmation(msg: impl Into<String>) -> Self {
        Self::Confirmation(Arc::from(msg.into()))
    }

    /// Create a configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }

    /// Whether this is a locally detected, user-correctable error
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
