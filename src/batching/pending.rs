// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending buffer with swap-out semantics.
//!
//! The [`PendingBuffer`] collects items until a flush takes them all at once.
//! Taking replaces the buffer with an empty one, so every item leaves in
//! exactly one [`FlushBatch`].
//!
//! # Example
//!
//! ```
//! use deferred_queue::{PendingBuffer, FlushReason};
//!
//! let mut buffer: PendingBuffer<&str> = PendingBuffer::new(2);
//! assert!(buffer.is_empty());
//!
//! assert_eq!(buffer.push("a"), None);
//! assert_eq!(buffer.push("b"), Some(FlushReason::Count));
//!
//! let batch = buffer.take(FlushReason::Manual).unwrap();
//! assert_eq!(batch.items, vec!["a", "b"]);
//! assert!(buffer.is_empty());
//! assert!(buffer.take(FlushReason::Manual).is_none());
//! ```

use std::time::{Duration, Instant};
use tracing::debug;

/// Why a flush ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Timer tick
    Time,
    /// Count threshold reached
    Count,
    /// Explicit `flush()` call
    Manual,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Items swapped out of the buffer, ready for processing
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
    /// Time since the oldest item in the batch was buffered
    pub age: Duration,
}

/// Buffer of items awaiting flush, in insertion order.
#[derive(Debug)]
pub struct PendingBuffer<T> {
    items: Vec<T>,
    first_at: Option<Instant>,
    flush_count: usize,
}

impl<T> PendingBuffer<T> {
    pub fn new(flush_count: usize) -> Self {
        Self {
            items: Vec::new(),
            first_at: None,
            flush_count: flush_count.max(1),
        }
    }

    /// Add an item, returns `Some(Count)` once the count threshold is reached
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        if self.items.is_empty() {
            self.first_at = Some(Instant::now());
        }
        self.items.push(item);

        if self.items.len() >= self.flush_count {
            Some(FlushReason::Count)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Age of the oldest pending item (zero when empty)
    #[must_use]
    pub fn age(&self) -> Duration {
        self.first_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Swap the buffer for an empty one. Returns `None` when nothing is pending.
    pub fn take(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        if self.items.is_empty() {
            return None;
        }
        let age = self.age();
        self.first_at = None;
        let items = std::mem::take(&mut self.items);
        debug!(count = items.len(), reason = %reason, "Pending buffer taken for flush");
        Some(FlushBatch { items, reason, age })
    }

    /// Drop everything pending, returning how many items were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        self.first_at = None;
        count
    }
}
