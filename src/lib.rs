//! # Deferred Queue
//!
//! Buffer individually-submitted writes and persist them as batched bulk
//! operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DeferredQueue<T, P>                    │
//! │  • add() / try_add() from any number of producers          │
//! │  • Bounded or unbounded, explicit overflow policy          │
//! │  • Background loop: timer tick or count threshold          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                (atomic swap of the pending buffer)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               BatchProcessor<T>::process(batch)             │
//! │  • EntityBatchProcessor: classify → Update/Insert/Upsert   │
//! │  • RetryingProcessor: bounded retry around any processor   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (one bulk call per write intent)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        BulkStore<E>                         │
//! │  • bulk_update / bulk_insert / bulk_upsert                 │
//! │  • InMemoryBulkStore for tests and demos                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deferred_queue::{
//!     DeferredQueue, DeferredQueueConfig, Entity, EntityBatchProcessor, InMemoryBulkStore,
//! };
//! use std::sync::Arc;
//!
//! #[derive(Clone)]
//! struct User { id: Option<u64>, loaded: bool }
//!
//! impl Entity for User {
//!     type Key = u64;
//!     fn key(&self) -> Option<u64> { self.id }
//!     fn is_from_store(&self) -> bool { self.loaded }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryBulkStore::<User>::new());
//!     let queue = DeferredQueue::new(
//!         DeferredQueueConfig { flush_ms: 200, ..Default::default() },
//!         EntityBatchProcessor::<User, _>::new(store.clone()),
//!     );
//!     queue.start().expect("Failed to start");
//!
//!     queue.add(User { id: None, loaded: false }).await.ok();   // insert
//!     queue.add(User { id: Some(7), loaded: false }).await.ok(); // upsert
//!
//!     queue.shutdown().await.expect("final flush");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`queue`]: the [`DeferredQueue`] and its lifecycle
//! - [`batching`]: pending buffer and flush reasons
//! - [`entity`]: write classification and the entity processor
//! - [`storage`]: bulk-persistence boundary
//! - [`resilience`]: retry with backoff
//! - [`host`]: ordered start/stop of hosted services
//! - [`backpressure`]: fill levels for bounded queues

pub mod config;
pub mod backpressure;
pub mod batching;
pub mod processor;
pub mod entity;
pub mod storage;
pub mod resilience;
pub mod queue;
pub mod host;
pub mod metrics;

pub use config::{DeferredQueueConfig, OverflowPolicy};
pub use backpressure::BackpressureLevel;
pub use batching::{FlushBatch, FlushReason, PendingBuffer};
pub use processor::{BatchProcessor, ProcessError};
pub use entity::{classify, Entity, EntityBatchProcessor, Partition, Rejected, ValidationError, WriteIntent};
pub use storage::{BulkStore, InMemoryBulkStore, StorageError};
pub use resilience::retry::{RetryConfig, RetryingProcessor};
pub use queue::{AddError, DeferredQueue, FlushFailure, QueueError, QueueState, QueueStats};
pub use host::{cancel_pair, CancelSignal, Host, HostError, HostedService, NoopServiceManager, ServiceManager};
pub use metrics::LatencyTimer;
