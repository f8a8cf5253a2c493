//! Buffering of pending items between flushes.

pub mod pending;

pub use pending::{FlushBatch, FlushReason, PendingBuffer};
