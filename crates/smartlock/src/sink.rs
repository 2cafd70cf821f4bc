//! Best-effort external audit sink.
//!
//! Audit events are mirrored to a single HTTP endpoint as a JSON body
//! `{"action": ..., ...fields}`. Delivery is fire-and-forget: [`AuditSink::emit`]
//! never blocks the caller, never returns an error and never retries. Failures
//! are logged and dropped. The response is never read.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::model::LogType;

/// An event mirrored to the audit sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SinkEvent {
    /// An access log entry was written
    Log {
        /// Log entry kind
        #[serde(rename = "type")]
        kind: LogType,
        /// Description
        detail: String,
        /// Origin tag
        source: String,
    },
    /// An RFID tag was enrolled
    AddTag {
        /// Card identifier
        uid: String,
        /// Display label
        name: String,
    },
    /// A knock pattern was enrolled
    AddPattern {
        /// Display label
        name: String,
        /// Milliseconds between taps
        intervals: Vec<u64>,
    },
}

impl SinkEvent {
    /// The `action` tag of this event
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::AddTag { .. } => "add_tag",
            Self::AddPattern { .. } => "add_pattern",
        }
    }
}

/// Write-only destination for audit events
pub trait AuditSink: Send + Sync {
    /// Hand an event off for delivery. Must return without waiting on I/O.
    fn emit(&self, event: SinkEvent);
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, event: SinkEvent) {
        debug!(action = event.action(), "Audit sink disabled, dropping event");
    }
}

/// Sink that POSTs each event to an HTTP endpoint from a detached task
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// Create a sink posting to `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Endpoint events are posted to
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for HttpSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSink").field("url", &self.url).finish()
    }
}

impl AuditSink for HttpSink {
    fn emit(&self, event: SinkEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(action = event.action(), "No async runtime, audit event dropped");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            let action = event.action();
            match client.post(&url).json(&event).send().await {
                Ok(_) => debug!(action, "Sent to audit sink"),
                Err(e) => warn!(action, error = %e, "Audit sink delivery failed"),
            }
        });
    }
}
