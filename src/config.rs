// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a deferred queue.
//!
//! # Example
//!
//! ```
//! use deferred_queue::{DeferredQueueConfig, OverflowPolicy};
//!
//! // Minimal config (uses defaults)
//! let config = DeferredQueueConfig::default();
//! assert_eq!(config.flush_ms, 1000);
//! assert_eq!(config.max_pending, None); // unbounded
//!
//! // Bounded queue that blocks producers when full
//! let config = DeferredQueueConfig {
//!     name: "orders".into(),
//!     flush_ms: 250,
//!     flush_count: 500,
//!     max_pending: Some(10_000),
//!     overflow: OverflowPolicy::Block,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;
use std::time::Duration;

/// What `add` does when `max_pending` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Return [`AddError::Full`](crate::AddError::Full) with the item handed back
    #[default]
    Reject,
    /// Wait until a flush frees space (needs the background loop or explicit flushes)
    Block,
}

/// Configuration for a [`DeferredQueue`](crate::DeferredQueue).
///
/// All fields have defaults, so a config can be deserialized from a partial
/// document.
#[derive(Debug, Clone, Deserialize)]
pub struct DeferredQueueConfig {
    /// Name used in logs and as the hosted service name
    #[serde(default = "default_name")]
    pub name: String,

    /// Timer flush interval in milliseconds
    #[serde(default = "default_flush_ms")]
    pub flush_ms: u64,

    /// Flush as soon as this many items are pending
    #[serde(default = "default_flush_count")]
    pub flush_count: usize,

    /// Hard cap on pending items (None = unbounded, 0 is treated as 1)
    #[serde(default)]
    pub max_pending: Option<usize>,

    /// Behaviour of `add` once `max_pending` is reached
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Backpressure thresholds, as a fraction of `max_pending`
    #[serde(default = "default_backpressure_warn")]
    pub backpressure_warn: f64,
    #[serde(default = "default_backpressure_critical")]
    pub backpressure_critical: f64,

    /// Flush remaining items during shutdown (false = discard and log)
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,

    /// Buffered flush failure reports per subscriber
    #[serde(default = "default_failure_channel_capacity")]
    pub failure_channel_capacity: usize,
}

fn default_name() -> String { "deferred-queue".to_string() }
fn default_flush_ms() -> u64 { 1000 }
fn default_flush_count() -> usize { 5000 }
fn default_backpressure_warn() -> f64 { 0.7 }
fn default_backpressure_critical() -> f64 { 0.9 }
fn default_flush_on_shutdown() -> bool { true }
fn default_failure_channel_capacity() -> usize { 64 }

impl Default for DeferredQueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            flush_ms: default_flush_ms(),
            flush_count: default_flush_count(),
            max_pending: None,
            overflow: OverflowPolicy::default(),
            backpressure_warn: default_backpressure_warn(),
            backpressure_critical: default_backpressure_critical(),
            flush_on_shutdown: default_flush_on_shutdown(),
            failure_channel_capacity: default_failure_channel_capacity(),
        }
    }
}

impl DeferredQueueConfig {
    /// Timer interval for the background loop (never zero).
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_ms.max(1))
    }

    /// Count threshold (never zero).
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        self.flush_count.max(1)
    }

    /// Pending-item cap (never zero; `None` = unbounded).
    #[must_use]
    pub fn pending_cap(&self) -> Option<usize> {
        self.max_pending.map(|max| max.max(1))
    }
}
