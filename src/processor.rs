// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The processing hook a [`DeferredQueue`](crate::DeferredQueue) calls on flush.

use async_trait::async_trait;
use thiserror::Error;

use crate::entity::WriteIntent;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum ProcessError {
    /// A sub-batch failed; the sub-batches in `completed` are already committed
    #[error("{intent} dispatch failed after {committed} rows committed: {source}")]
    Dispatch {
        intent: WriteIntent,
        /// Intents dispatched successfully before `intent`, in dispatch order
        completed: Vec<WriteIntent>,
        committed: usize,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Batch processing failed: {0}")]
    Other(String),
}

impl ProcessError {
    /// True when part of the batch is already committed.
    ///
    /// Re-running such a batch would write the committed part twice.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Dispatch { completed, .. } if !completed.is_empty())
    }
}

/// Persists one flushed batch and returns the number of affected rows.
///
/// The queue has already removed `batch` from its buffer when this runs, so
/// an `Err` loses the batch unless the implementation re-queues it.
/// [`RetryingProcessor`](crate::RetryingProcessor) wraps any processor with
/// bounded retries.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync + 'static {
    async fn process(&self, batch: Vec<T>) -> Result<usize, ProcessError>;
}

#[async_trait]
impl<T, P> BatchProcessor<T> for std::sync::Arc<P>
where
    T: Send + 'static,
    P: BatchProcessor<T> + ?Sized,
{
    async fn process(&self, batch: Vec<T>) -> Result<usize, ProcessError> {
        (**self).process(batch).await
    }
}
