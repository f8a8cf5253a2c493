//! Public types for the deferred queue.

use std::fmt;
use thiserror::Error;

use crate::batching::FlushReason;
use crate::processor::ProcessError;

/// Queue lifecycle state.
///
/// ```text
/// Created → Running → ShuttingDown → Stopped
/// ```
///
/// A queue that is never started goes straight from `Created` to
/// `ShuttingDown` on [`shutdown`](super::DeferredQueue::shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Constructed, background loop not running; `add` and `flush` work
    Created,
    /// Background loop running
    Running,
    /// Final flush in progress, new items rejected
    ShuttingDown,
    /// Closed for good
    Stopped,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time counters for a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently buffered
    pub pending: usize,
    /// Items accepted by `add`/`try_add`
    pub added: u64,
    /// Items refused (full or closed)
    pub rejected: u64,
    /// Processor invocations
    pub flushes: u64,
    /// Processor invocations that returned an error
    pub failed_flushes: u64,
    /// Items handed to the processor, including failed batches
    pub items_flushed: u64,
    /// Sum of rows reported by successful flushes
    pub rows_affected: u64,
}

/// Report published on the failure channel when a background flush fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushFailure {
    pub queue: String,
    pub reason: FlushReason,
    pub batch_size: usize,
    pub error: String,
}

/// Refusal from `add`/`try_add`. The item is handed back to the caller.
#[derive(Error)]
pub enum AddError<T> {
    #[error("queue is full ({capacity} items pending)")]
    Full { capacity: usize, item: T },
    #[error("queue is closed")]
    Closed { item: T },
}

impl<T> AddError<T> {
    /// Recover the refused item
    pub fn into_item(self) -> T {
        match self {
            Self::Full { item, .. } | Self::Closed { item } => item,
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

impl<T> fmt::Debug for AddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { capacity, .. } => f
                .debug_struct("Full")
                .field("capacity", capacity)
                .finish_non_exhaustive(),
            Self::Closed { .. } => f.debug_struct("Closed").finish_non_exhaustive(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("background loop already started")]
    AlreadyStarted,
    #[error("queue is closed")]
    Closed,
    #[error("no tokio runtime available to run the background loop")]
    NoRuntime,
    /// The batch was already removed from the buffer and is not retried
    #[error("{reason} flush of {batch_size} items failed: {source}")]
    Processing {
        reason: FlushReason,
        batch_size: usize,
        #[source]
        source: ProcessError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_error_hands_item_back() {
        let err = AddError::Full { capacity: 3, item: "x".to_string() };
        assert!(err.is_full());
        assert_eq!(err.to_string(), "queue is full (3 items pending)");
        assert_eq!(err.into_item(), "x");

        let err = AddError::Closed { item: 7 };
        assert!(!err.is_full());
        assert_eq!(err.into_item(), 7);
    }

    #[test]
    fn test_add_error_debug_does_not_need_item_debug() {
        struct Opaque;
        let err = AddError::Full { capacity: 1, item: Opaque };
        assert!(format!("{:?}", err).starts_with("Full"));
    }

    #[test]
    fn test_processing_error_message() {
        let err = QueueError::Processing {
            reason: FlushReason::Manual,
            batch_size: 4,
            source: ProcessError::Other("boom".into()),
        };
        assert_eq!(err.to_string(), "manual flush of 4 items failed: Batch processing failed: boom");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(QueueState::Running.to_string(), "Running");
        assert_eq!(QueueState::Stopped.to_string(), "Stopped");
    }
}
