// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity model and write classification.
//!
//! Every buffered entity is routed to exactly one bulk operation by
//! [`classify`]:
//!
//! ```text
//! is_from_store()? ──yes──▶ Update
//!        │no
//! has_null_key()?  ──yes──▶ Insert
//!        │no
//!        └────────────────▶ Upsert (after validate())
//! ```
//!
//! # Example
//!
//! ```
//! use deferred_queue::{classify, Entity, WriteIntent};
//!
//! struct Order { id: Option<u64>, loaded: bool }
//!
//! impl Entity for Order {
//!     type Key = u64;
//!     fn key(&self) -> Option<u64> { self.id }
//!     fn is_from_store(&self) -> bool { self.loaded }
//! }
//!
//! assert_eq!(classify(&Order { id: Some(1), loaded: true }), WriteIntent::Update);
//! assert_eq!(classify(&Order { id: None, loaded: false }), WriteIntent::Insert);
//! assert_eq!(classify(&Order { id: Some(2), loaded: false }), WriteIntent::Upsert);
//! ```

pub mod processor;

use std::fmt;
use std::hash::Hash;
use thiserror::Error;

pub use processor::{EntityBatchProcessor, Partition, Rejected};

/// An item that can be persisted through a [`BulkStore`](crate::BulkStore).
pub trait Entity: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Identity key, `None` until the store assigns one
    fn key(&self) -> Option<Self::Key>;

    /// True when this value was materialized by reading the store
    fn is_from_store(&self) -> bool;

    fn has_null_key(&self) -> bool {
        self.key().is_none()
    }

    /// Checked before upsert dispatch; failing items are dropped from the batch.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("validation failed: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Which bulk operation an entity is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteIntent {
    Update,
    Insert,
    Upsert,
}

impl WriteIntent {
    /// Order in which sub-batches are dispatched
    pub const DISPATCH_ORDER: [WriteIntent; 3] = [Self::Update, Self::Insert, Self::Upsert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Insert => "insert",
            Self::Upsert => "upsert",
        }
    }
}

impl fmt::Display for WriteIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an entity. Precedence: Update, then Insert, else Upsert.
#[must_use]
pub fn classify<E: Entity + ?Sized>(item: &E) -> WriteIntent {
    if item.is_from_store() {
        WriteIntent::Update
    } else if item.has_null_key() {
        WriteIntent::Insert
    } else {
        WriteIntent::Upsert
    }
}
