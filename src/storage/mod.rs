//! Bulk-persistence boundary and an in-memory implementation.

pub mod traits;
pub mod memory;

pub use memory::InMemoryBulkStore;
pub use traits::{BulkStore, StorageError};
