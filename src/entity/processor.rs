// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity batch processor: classify a flushed batch and dispatch one bulk
//! call per write intent.
//!
//! ```text
//! flush batch ──▶ Partition ──┬─▶ updates ──▶ bulk_update(.., true)
//!   (None skipped)            ├─▶ inserts ──▶ bulk_insert(.., true)
//!                             └─▶ upserts ──▶ validate() ──▶ bulk_upsert(..)
//! ```

use async_trait::async_trait;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{classify, Entity, ValidationError, WriteIntent};
use crate::processor::{BatchProcessor, ProcessError};
use crate::storage::traits::{BulkStore, StorageError};

/// A batch split by write intent, each list in batch order.
#[derive(Debug)]
pub struct Partition<E> {
    pub updates: Vec<E>,
    pub inserts: Vec<E>,
    pub upserts: Vec<E>,
    /// Null slots dropped while partitioning
    pub skipped: usize,
}

impl<E> Default for Partition<E> {
    fn default() -> Self {
        Self {
            updates: Vec::new(),
            inserts: Vec::new(),
            upserts: Vec::new(),
            skipped: 0,
        }
    }
}

impl<E: Entity> Partition<E> {
    pub fn from_batch<I>(batch: impl IntoIterator<Item = I>) -> Self
    where
        I: Into<Option<E>>,
    {
        let mut partition = Self::default();
        for slot in batch {
            match slot.into() {
                Some(item) => partition.push(item),
                None => partition.skipped += 1,
            }
        }
        partition
    }

    pub fn push(&mut self, item: E) {
        match classify(&item) {
            WriteIntent::Update => self.updates.push(item),
            WriteIntent::Insert => self.inserts.push(item),
            WriteIntent::Upsert => self.upserts.push(item),
        }
    }

    /// Number of classified entities (excludes skipped slots)
    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.len() + self.inserts.len() + self.upserts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An upsert dropped by validation, reported on the rejection channel.
#[derive(Debug)]
pub struct Rejected<E> {
    pub item: E,
    pub error: ValidationError,
}

/// [`BatchProcessor`] that routes entities to a [`BulkStore`].
///
/// Accepts any queue item convertible into `Option<E>`, so a queue may carry
/// `E` directly or nullable `Option<E>` slots; `None` slots are skipped.
///
/// Upserts failing [`Entity::validate`] are dropped without error. Attach a
/// channel with [`with_rejections`](Self::with_rejections) to observe them.
pub struct EntityBatchProcessor<E: Entity, S> {
    store: S,
    name: String,
    rejections: Option<mpsc::Sender<Rejected<E>>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E, S> EntityBatchProcessor<E, S>
where
    E: Entity,
    S: BulkStore<E>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            name: "entity".to_string(),
            rejections: None,
            _entity: PhantomData,
        }
    }

    /// Label for this processor's metrics, usually the owning queue's name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Report upserts dropped by validation on `tx`.
    ///
    /// Reports are sent with `try_send`: when the channel is full the report
    /// is dropped (and logged) so an undrained receiver never stalls a flush.
    #[must_use]
    pub fn with_rejections(mut self, tx: mpsc::Sender<Rejected<E>>) -> Self {
        self.rejections = Some(tx);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn retain_valid(&self, upserts: Vec<E>) -> Vec<E> {
        let mut valid = Vec::with_capacity(upserts.len());
        for item in upserts {
            match item.validate() {
                Ok(()) => valid.push(item),
                Err(error) => {
                    debug!(processor = %self.name, key = ?item.key(), error = %error, "Dropping invalid upsert");
                    crate::metrics::record_validation_skip(&self.name);
                    self.report(Rejected { item, error });
                }
            }
        }
        valid
    }

    fn report(&self, rejected: Rejected<E>) {
        let Some(tx) = &self.rejections else {
            return;
        };
        match tx.try_send(rejected) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(rejected)) => {
                warn!(
                    processor = %self.name,
                    key = ?rejected.item.key(),
                    "Rejection channel full, report dropped"
                );
            }
            // receiver gone just means nobody is listening anymore
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn dispatch_failed<'a>(
    name: &'a str,
    intent: WriteIntent,
    completed: &'a [WriteIntent],
    committed: usize,
) -> impl FnOnce(StorageError) -> ProcessError + 'a {
    move |source| {
        crate::metrics::record_dispatch(name, intent.as_str(), "error");
        ProcessError::Dispatch {
            intent,
            completed: completed.to_vec(),
            committed,
            source,
        }
    }
}

#[async_trait]
impl<E, S, I> BatchProcessor<I> for EntityBatchProcessor<E, S>
where
    E: Entity,
    S: BulkStore<E> + 'static,
    I: Into<Option<E>> + Send + 'static,
{
    async fn process(&self, batch: Vec<I>) -> Result<usize, ProcessError> {
        let Partition {
            updates,
            inserts,
            upserts,
            skipped,
        } = Partition::<E>::from_batch(batch);

        if skipped > 0 {
            debug!(processor = %self.name, skipped, "Skipped null slots in batch");
        }

        let name = self.name.as_str();
        let mut rows = 0;
        let mut completed = Vec::with_capacity(WriteIntent::DISPATCH_ORDER.len());

        if !updates.is_empty() {
            rows += self
                .store
                .bulk_update(&updates, true)
                .await
                .map_err(dispatch_failed(name, WriteIntent::Update, &completed, rows))?;
            crate::metrics::record_dispatch(name, "update", "success");
            completed.push(WriteIntent::Update);
        }

        if !inserts.is_empty() {
            rows += self
                .store
                .bulk_insert(&inserts, true)
                .await
                .map_err(dispatch_failed(name, WriteIntent::Insert, &completed, rows))?;
            crate::metrics::record_dispatch(name, "insert", "success");
            completed.push(WriteIntent::Insert);
        }

        if !upserts.is_empty() {
            let valid = self.retain_valid(upserts);
            if !valid.is_empty() {
                rows += self
                    .store
                    .bulk_upsert(&valid)
                    .await
                    .map_err(dispatch_failed(name, WriteIntent::Upsert, &completed, rows))?;
                crate::metrics::record_dispatch(name, "upsert", "success");
                completed.push(WriteIntent::Upsert);
            }
        }

        debug!(
            processor = %name,
            updates = updates.len(),
            inserts = inserts.len(),
            rows,
            "Entity batch dispatched"
        );
        Ok(rows)
    }
}
