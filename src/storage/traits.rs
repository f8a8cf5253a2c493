use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Constraint violation on '{key}': {message}")]
    Conflict {
        key: String,
        message: String,
    },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Bulk-persistence collaborator called by
/// [`EntityBatchProcessor`](crate::EntityBatchProcessor).
///
/// Each operation commits a whole slice in one round trip and returns the
/// number of affected rows. `use_batch` asks the backend to use its native
/// batch path (multi-row statements, pipelining) rather than row-by-row calls.
#[async_trait]
pub trait BulkStore<E>: Send + Sync {
    async fn bulk_update(&self, items: &[E], use_batch: bool) -> Result<usize, StorageError>;
    async fn bulk_insert(&self, items: &[E], use_batch: bool) -> Result<usize, StorageError>;

    /// Insert-or-replace by identity key. Items reaching this call have
    /// already passed validation.
    async fn bulk_upsert(&self, items: &[E]) -> Result<usize, StorageError>;
}

#[async_trait]
impl<E, S> BulkStore<E> for std::sync::Arc<S>
where
    E: Sync,
    S: BulkStore<E> + ?Sized,
{
    async fn bulk_update(&self, items: &[E], use_batch: bool) -> Result<usize, StorageError> {
        (**self).bulk_update(items, use_batch).await
    }

    async fn bulk_insert(&self, items: &[E], use_batch: bool) -> Result<usize, StorageError> {
        (**self).bulk_insert(items, use_batch).await
    }

    async fn bulk_upsert(&self, items: &[E]) -> Result<usize, StorageError> {
        (**self).bulk_upsert(items).await
    }
}
