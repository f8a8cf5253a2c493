use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::entity::Entity;
use super::traits::{BulkStore, StorageError};

/// In-memory [`BulkStore`] with row-count semantics close to a SQL table.
///
/// - update: counts only rows whose key already exists
/// - insert: fails the whole call on a duplicate key; keyless rows are kept
///   in a separate list since nothing assigns them an identity
/// - upsert: inserts or replaces, every row counts
pub struct InMemoryBulkStore<E: Entity> {
    rows: DashMap<E::Key, E>,
    keyless: Mutex<Vec<E>>,
    fail_next: Mutex<Option<StorageError>>,
    calls: AtomicUsize,
}

impl<E: Entity + Clone> InMemoryBulkStore<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            keyless: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Keyed row count
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.keyless.lock().is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.rows.get(key).map(|r| r.value().clone())
    }

    /// Rows inserted without a key
    #[must_use]
    pub fn keyless(&self) -> Vec<E> {
        self.keyless.lock().clone()
    }

    /// Number of bulk calls served (including failed ones)
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Make the next bulk call fail with `err`
    pub fn fail_next(&self, err: StorageError) {
        *self.fail_next.lock() = Some(err);
    }

    fn begin(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<E: Entity + Clone> Default for InMemoryBulkStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Entity + Clone> BulkStore<E> for InMemoryBulkStore<E> {
    async fn bulk_update(&self, items: &[E], _use_batch: bool) -> Result<usize, StorageError> {
        self.begin()?;
        let mut affected = 0;
        for item in items {
            if let Some(key) = item.key() {
                if let Some(mut row) = self.rows.get_mut(&key) {
                    *row = item.clone();
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn bulk_insert(&self, items: &[E], _use_batch: bool) -> Result<usize, StorageError> {
        self.begin()?;
        // all-or-nothing like a single multi-row INSERT
        if let Some(key) = items
            .iter()
            .filter_map(|item| item.key())
            .find(|key| self.rows.contains_key(key))
        {
            return Err(StorageError::Conflict {
                key: format!("{:?}", key),
                message: "duplicate key".to_string(),
            });
        }

        for item in items {
            match item.key() {
                Some(key) => {
                    self.rows.insert(key, item.clone());
                }
                None => self.keyless.lock().push(item.clone()),
            }
        }
        Ok(items.len())
    }

    async fn bulk_upsert(&self, items: &[E]) -> Result<usize, StorageError> {
        self.begin()?;
        for item in items {
            match item.key() {
                Some(key) => {
                    self.rows.insert(key, item.clone());
                }
                None => self.keyless.lock().push(item.clone()),
            }
        }
        Ok(items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        id: Option<u64>,
        body: &'static str,
    }

    impl Entity for Doc {
        type Key = u64;
        fn key(&self) -> Option<u64> {
            self.id
        }
        fn is_from_store(&self) -> bool {
            false
        }
    }

    fn doc(id: Option<u64>, body: &'static str) -> Doc {
        Doc { id, body }
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store: InMemoryBulkStore<Doc> = InMemoryBulkStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store: InMemoryBulkStore<Doc> = InMemoryBulkStore::new();
        let n = store.bulk_insert(&[doc(Some(1), "a"), doc(None, "b")], true).await.unwrap();

        assert_eq!(n, 2);
        assert_eq!(store.get(&1).unwrap().body, "a");
        assert_eq!(store.keyless(), vec![doc(None, "b")]);
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails_whole_call() {
        let store: InMemoryBulkStore<Doc> = InMemoryBulkStore::new();
        store.bulk_insert(&[doc(Some(1), "a")], true).await.unwrap();

        let err = store
            .bulk_insert(&[doc(Some(2), "b"), doc(Some(1), "dup")], true)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert!(store.get(&2).is_none());
        assert_eq!(store.get(&1).unwrap().body, "a");
    }

    #[tokio::test]
    async fn test_update_counts_only_existing_rows() {
        let store: InMemoryBulkStore<Doc> = InMemoryBulkStore::new();
        store.bulk_insert(&[doc(Some(1), "a")], true).await.unwrap();

        let n = store.bulk_update(&[doc(Some(1), "a2"), doc(Some(9), "ghost")], true).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get(&1).unwrap().body, "a2");
        assert!(store.get(&9).is_none());
    }

    #[tokio::test]
    async fn test_upsert_inserts_or_replaces() {
        let store: InMemoryBulkStore<Doc> = InMemoryBulkStore::new();
        store.bulk_insert(&[doc(Some(1), "a")], true).await.unwrap();

        let n = store.bulk_upsert(&[doc(Some(1), "a2"), doc(Some(2), "b")]).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&1).unwrap().body, "a2");
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let store: InMemoryBulkStore<Doc> = InMemoryBulkStore::new();
        store.fail_next(StorageError::Unavailable("gone".into()));

        assert!(store.bulk_upsert(&[doc(Some(1), "a")]).await.is_err());
        assert!(store.bulk_upsert(&[doc(Some(1), "a")]).await.is_ok());
        assert_eq!(store.calls(), 2);
        assert_eq!(store.len(), 1);
    }
}
