//! Queue behaviour tests: flushing, thresholds, backpressure, failures,
//! shutdown and hosting.
//!
//! Run with: `cargo test --test queue`

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use deferred_queue::{
    cancel_pair, AddError, BatchProcessor, BulkStore, DeferredQueue, DeferredQueueConfig, Entity,
    EntityBatchProcessor, FlushReason, Host, InMemoryBulkStore, OverflowPolicy, ProcessError,
    QueueError, QueueState, RetryConfig, RetryingProcessor, StorageError, WriteIntent,
};

// =============================================================================
// Helpers
// =============================================================================

/// Records every batch; returns one row per item. Fails the first
/// `fail_first` calls.
#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<Vec<u32>>>,
    calls: AtomicUsize,
    fail_first: usize,
}

impl Collector {
    fn failing(fail_first: usize) -> Self {
        Self { fail_first, ..Default::default() }
    }

    fn items(&self) -> Vec<u32> {
        self.batches.lock().iter().flatten().copied().collect()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchProcessor<u32> for Collector {
    async fn process(&self, batch: Vec<u32>) -> Result<usize, ProcessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(ProcessError::Storage(StorageError::Unavailable(format!("call {}", call))));
        }
        let rows = batch.len();
        self.batches.lock().push(batch);
        Ok(rows)
    }
}

fn config(flush_ms: u64, flush_count: usize) -> DeferredQueueConfig {
    DeferredQueueConfig {
        name: "test".into(),
        flush_ms,
        flush_count,
        ..Default::default()
    }
}

fn queue_with(
    config: DeferredQueueConfig,
    collector: &Arc<Collector>,
) -> DeferredQueue<u32, Arc<Collector>> {
    DeferredQueue::new(config, collector.clone())
}

/// Poll `cond` until it holds or two seconds pass
async fn wait_for(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[derive(Debug, Clone, PartialEq)]
struct Account {
    name: &'static str,
    id: Option<u64>,
    loaded: bool,
    valid: bool,
}

impl Entity for Account {
    type Key = u64;
    fn key(&self) -> Option<u64> {
        self.id
    }
    fn is_from_store(&self) -> bool {
        self.loaded
    }
    fn validate(&self) -> Result<(), deferred_queue::ValidationError> {
        if self.valid {
            Ok(())
        } else {
            Err(deferred_queue::ValidationError::new("bad account"))
        }
    }
}

fn account(name: &'static str, id: Option<u64>, loaded: bool) -> Account {
    Account { name, id, loaded, valid: true }
}

/// Bulk store stub logging each call with its item names
struct RecordingStore {
    calls: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self { calls: Mutex::new(Vec::new()) }
    }

    fn log(&self, op: &str, items: &[Account], use_batch: Option<bool>) {
        let names: Vec<&str> = items.iter().map(|a| a.name).collect();
        let suffix = use_batch.map(|b| format!(":{}", b)).unwrap_or_default();
        self.calls.lock().push(format!("{}({}){}", op, names.join(","), suffix));
    }
}

#[async_trait]
impl BulkStore<Account> for RecordingStore {
    async fn bulk_update(&self, items: &[Account], use_batch: bool) -> Result<usize, StorageError> {
        self.log("update", items, Some(use_batch));
        Ok(10)
    }

    async fn bulk_insert(&self, items: &[Account], use_batch: bool) -> Result<usize, StorageError> {
        self.log("insert", items, Some(use_batch));
        Ok(20)
    }

    async fn bulk_upsert(&self, items: &[Account]) -> Result<usize, StorageError> {
        self.log("upsert", items, None);
        Ok(30)
    }
}

/// In-memory store whose first `upsert_failures` upserts fail
struct FlakyUpsertStore {
    rows: InMemoryBulkStore<Account>,
    upsert_failures: AtomicUsize,
    inserts: AtomicUsize,
    upserts: AtomicUsize,
}

impl FlakyUpsertStore {
    fn new(upsert_failures: usize) -> Self {
        Self {
            rows: InMemoryBulkStore::new(),
            upsert_failures: AtomicUsize::new(upsert_failures),
            inserts: AtomicUsize::new(0),
            upserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BulkStore<Account> for FlakyUpsertStore {
    async fn bulk_update(&self, items: &[Account], use_batch: bool) -> Result<usize, StorageError> {
        self.rows.bulk_update(items, use_batch).await
    }

    async fn bulk_insert(&self, items: &[Account], use_batch: bool) -> Result<usize, StorageError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.rows.bulk_insert(items, use_batch).await
    }

    async fn bulk_upsert(&self, items: &[Account]) -> Result<usize, StorageError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.upsert_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.upsert_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("upsert path down".into()));
        }
        self.rows.bulk_upsert(items).await
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
        max_retries: Some(3),
    }
}

// =============================================================================
// Flushing
// =============================================================================

#[tokio::test]
async fn empty_flush_returns_zero_without_calling_processor() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(60_000, 100), &collector);

    assert_eq!(queue.flush().await.unwrap(), 0);
    assert_eq!(queue.flush().await.unwrap(), 0);
    assert_eq!(collector.calls(), 0);
    assert_eq!(queue.stats().flushes, 0);
}

#[tokio::test]
async fn manual_flush_processes_items_in_order_once() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(60_000, 100), &collector);

    for i in 0..5 {
        queue.add(i).await.unwrap();
    }
    assert_eq!(queue.len(), 5);

    assert_eq!(queue.flush().await.unwrap(), 5);
    assert!(queue.is_empty());
    assert_eq!(*collector.batches.lock(), vec![vec![0, 1, 2, 3, 4]]);

    // nothing left to process twice
    assert_eq!(queue.flush().await.unwrap(), 0);
    assert_eq!(collector.calls(), 1);
}

#[tokio::test]
async fn entity_queue_dispatches_example_batch() {
    let store = Arc::new(RecordingStore::new());
    let queue: DeferredQueue<Option<Account>, _> = DeferredQueue::new(
        config(60_000, 100),
        EntityBatchProcessor::<Account, _>::new(store.clone()),
    );

    queue.add(Some(account("A", Some(1), true))).await.unwrap();
    queue.add(Some(account("B", None, false))).await.unwrap();
    queue.add(Some(account("C", Some(3), false))).await.unwrap();
    queue.add(None).await.unwrap();

    let rows = queue.flush().await.unwrap();
    assert_eq!(rows, 60);
    assert_eq!(
        *store.calls.lock(),
        vec!["update(A):true", "insert(B):true", "upsert(C)"]
    );
}

#[tokio::test]
async fn entity_queue_drops_invalid_upserts_without_error() {
    let store = Arc::new(RecordingStore::new());
    let queue: DeferredQueue<Account, _> = DeferredQueue::new(
        config(60_000, 100),
        EntityBatchProcessor::<Account, _>::new(store.clone()),
    );

    let mut bad = account("bad", Some(5), false);
    bad.valid = false;
    queue.add(bad).await.unwrap();
    queue.add(account("good", Some(6), false)).await.unwrap();

    assert_eq!(queue.flush().await.unwrap(), 30);
    assert_eq!(*store.calls.lock(), vec!["upsert(good)"]);
}

#[tokio::test]
async fn entity_queue_round_trip_through_memory_store() {
    let store = Arc::new(InMemoryBulkStore::<Account>::new());
    let queue: DeferredQueue<Account, _> = DeferredQueue::new(
        config(60_000, 100),
        EntityBatchProcessor::<Account, _>::new(store.clone()),
    );

    queue.add(account("new", None, false)).await.unwrap();
    queue.add(account("seeded", Some(1), false)).await.unwrap();
    assert_eq!(queue.flush().await.unwrap(), 2);

    // a value read back from the store is routed to update
    queue.add(account("seeded-v2", Some(1), true)).await.unwrap();
    assert_eq!(queue.flush().await.unwrap(), 1);

    assert_eq!(store.get(&1).unwrap().name, "seeded-v2");
    assert_eq!(store.keyless().len(), 1);
}

// =============================================================================
// Background loop
// =============================================================================

#[tokio::test]
async fn count_threshold_flushes_before_timer() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(60_000, 3), &collector);
    queue.start().unwrap();
    assert_eq!(queue.state(), QueueState::Running);

    for i in 0..3 {
        queue.add(i).await.unwrap();
    }

    assert!(wait_for(|| collector.items().len() == 3).await);
    assert_eq!(*collector.batches.lock(), vec![vec![0, 1, 2]]);

    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn timer_flushes_small_batches() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(20, 1000), &collector);
    queue.start().unwrap();

    queue.add(42).await.unwrap();
    assert!(wait_for(|| collector.items() == vec![42]).await);

    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn background_failure_is_published_and_loop_keeps_running() {
    let collector = Arc::new(Collector::failing(1));
    let queue = queue_with(config(60_000, 1), &collector);
    let mut failures = queue.subscribe_failures();
    queue.start().unwrap();

    queue.add(1).await.unwrap();
    let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
        .await
        .expect("failure published")
        .unwrap();
    assert_eq!(failure.queue, "test");
    assert_eq!(failure.reason, FlushReason::Count);
    assert_eq!(failure.batch_size, 1);

    // failed batch is not retried, the next one goes through
    queue.add(2).await.unwrap();
    assert!(wait_for(|| collector.items() == vec![2]).await);

    let stats = queue.stats();
    assert_eq!(stats.failed_flushes, 1);
    assert_eq!(stats.items_flushed, 2);
    assert_eq!(stats.rows_affected, 1);

    queue.shutdown().await.unwrap();
}

#[tokio::test]
async fn explicit_flush_failure_is_returned_and_batch_dropped() {
    let collector = Arc::new(Collector::failing(1));
    let queue = queue_with(config(60_000, 100), &collector);

    queue.add(7).await.unwrap();
    queue.add(8).await.unwrap();

    let err = queue.flush().await.unwrap_err();
    match err {
        QueueError::Processing { reason, batch_size, .. } => {
            assert_eq!(reason, FlushReason::Manual);
            assert_eq!(batch_size, 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(queue.flush().await.unwrap(), 0);
    assert_eq!(collector.calls(), 1);
}

#[tokio::test]
async fn retrying_processor_recovers_transient_failure() {
    let collector = Arc::new(Collector::failing(2));
    let queue: DeferredQueue<u32, _> = DeferredQueue::new(
        config(60_000, 100),
        RetryingProcessor::new(collector.clone(), fast_retry()),
    );

    queue.add(1).await.unwrap();
    assert_eq!(queue.flush().await.unwrap(), 1);
    assert_eq!(collector.calls(), 3);
    assert_eq!(collector.items(), vec![1]);
}

#[tokio::test]
async fn partial_dispatch_failure_is_not_rerun_by_retry() {
    let store = Arc::new(FlakyUpsertStore::new(1));
    let queue: DeferredQueue<Account, _> = DeferredQueue::new(
        config(60_000, 100),
        RetryingProcessor::new(EntityBatchProcessor::<Account, _>::new(store.clone()), fast_retry()),
    );

    queue.add(account("B", None, false)).await.unwrap();
    queue.add(account("C", Some(3), false)).await.unwrap();

    let err = queue.flush().await.unwrap_err();
    match err {
        QueueError::Processing {
            batch_size,
            source: ProcessError::Dispatch { intent, completed, committed, .. },
            ..
        } => {
            assert_eq!(batch_size, 2);
            assert_eq!(intent, WriteIntent::Upsert);
            assert_eq!(completed, vec![WriteIntent::Insert]);
            assert_eq!(committed, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // the committed insert is written exactly once; the failed upsert is not retried
    assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
    assert_eq!(store.upserts.load(Ordering::SeqCst), 1);
    assert_eq!(store.rows.keyless().len(), 1);
    assert!(store.rows.get(&3).is_none());
    assert_eq!(queue.stats().failed_flushes, 1);
}

#[tokio::test]
async fn dispatch_failure_before_any_commit_is_retried() {
    let store = Arc::new(FlakyUpsertStore::new(1));
    let queue: DeferredQueue<Account, _> = DeferredQueue::new(
        config(60_000, 100),
        RetryingProcessor::new(EntityBatchProcessor::<Account, _>::new(store.clone()), fast_retry()),
    );

    queue.add(account("C", Some(3), false)).await.unwrap();

    assert_eq!(queue.flush().await.unwrap(), 1);
    assert_eq!(store.upserts.load(Ordering::SeqCst), 2);
    assert_eq!(store.rows.get(&3).unwrap().name, "C");
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_lose_and_duplicate_nothing() {
    const PRODUCERS: u32 = 8;
    const PER_PRODUCER: u32 = 500;

    let collector = Arc::new(Collector::default());
    let queue = Arc::new(queue_with(config(5, 64), &collector));
    queue.start().unwrap();

    // manual flushes racing the background loop
    let done = Arc::new(AtomicBool::new(false));
    let flusher = {
        let queue = queue.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut rows = 0;
            while !done.load(Ordering::SeqCst) {
                rows += queue.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            rows
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    queue.add(p * PER_PRODUCER + i).await.unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    flusher.await.unwrap();
    queue.shutdown().await.unwrap();

    let items = collector.items();
    let total = (PRODUCERS * PER_PRODUCER) as usize;
    assert_eq!(items.len(), total);
    let unique: HashSet<u32> = items.iter().copied().collect();
    assert_eq!(unique.len(), total);
    assert_eq!(queue.stats().rows_affected, total as u64);

    // each producer's items keep their relative order
    for p in 0..PRODUCERS {
        let own: Vec<u32> = items
            .iter()
            .copied()
            .filter(|v| v / PER_PRODUCER == p)
            .collect();
        assert!(own.windows(2).all(|w| w[0] < w[1]));
    }
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn reject_policy_hands_item_back() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(
        DeferredQueueConfig {
            max_pending: Some(2),
            overflow: OverflowPolicy::Reject,
            ..config(60_000, 100)
        },
        &collector,
    );

    queue.add(1).await.unwrap();
    queue.try_add(2).unwrap();

    match queue.add(3).await {
        Err(AddError::Full { capacity, item }) => {
            assert_eq!(capacity, 2);
            assert_eq!(item, 3);
        }
        other => panic!("expected Full, got {other:?}"),
    }
    assert_eq!(queue.stats().rejected, 1);
    assert!(!queue.backpressure().should_accept_writes());

    queue.flush().await.unwrap();
    assert!(queue.try_add(3).is_ok());
}

#[tokio::test]
async fn block_policy_waits_for_flush() {
    let collector = Arc::new(Collector::default());
    let queue = Arc::new(queue_with(
        DeferredQueueConfig {
            max_pending: Some(2),
            overflow: OverflowPolicy::Block,
            ..config(60_000, 100)
        },
        &collector,
    ));

    queue.add(1).await.unwrap();
    queue.add(2).await.unwrap();
    // try_add never waits
    assert!(queue.try_add(3).unwrap_err().is_full());

    let blocked = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.add(3).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    assert_eq!(queue.flush().await.unwrap(), 2);
    tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("producer unblocked")
        .unwrap()
        .unwrap();
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn block_policy_with_running_loop_drains_itself() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(
        DeferredQueueConfig {
            max_pending: Some(4),
            overflow: OverflowPolicy::Block,
            ..config(60_000, 1000)
        },
        &collector,
    );
    queue.start().unwrap();

    // far more than max_pending; the full signal makes the loop flush early
    for i in 0..50 {
        tokio::time::timeout(Duration::from_secs(2), queue.add(i))
            .await
            .expect("add should not block forever")
            .unwrap();
    }
    queue.shutdown().await.unwrap();
    assert_eq!(collector.items(), (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn block_policy_with_zero_cap_still_makes_progress() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(
        DeferredQueueConfig {
            max_pending: Some(0),
            overflow: OverflowPolicy::Block,
            ..config(60_000, 1000)
        },
        &collector,
    );
    queue.start().unwrap();

    for i in 0..5 {
        tokio::time::timeout(Duration::from_secs(2), queue.add(i))
            .await
            .expect("zero cap must not block forever")
            .unwrap();
    }
    queue.shutdown().await.unwrap();
    assert_eq!(collector.items(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn reject_policy_with_zero_cap_accepts_one_item() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(
        DeferredQueueConfig {
            max_pending: Some(0),
            ..config(60_000, 1000)
        },
        &collector,
    );

    queue.try_add(1).unwrap();
    match queue.try_add(2) {
        Err(AddError::Full { capacity, item }) => {
            assert_eq!(capacity, 1);
            assert_eq!(item, 2);
        }
        other => panic!("expected Full, got {other:?}"),
    }
}

#[tokio::test]
async fn blocked_producer_sees_close() {
    let collector = Arc::new(Collector::default());
    let queue = Arc::new(queue_with(
        DeferredQueueConfig {
            max_pending: Some(1),
            overflow: OverflowPolicy::Block,
            flush_on_shutdown: false,
            ..config(60_000, 100)
        },
        &collector,
    ));

    queue.add(1).await.unwrap();
    let blocked = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.add(2).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    queue.shutdown().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("producer released")
        .unwrap();
    assert!(matches!(result, Err(AddError::Closed { item: 2 })));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn shutdown_flushes_remaining_and_closes() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(60_000, 100), &collector);
    queue.start().unwrap();

    queue.add_all(vec![1, 2, 3]).await.unwrap();
    let mut state = queue.state_receiver();

    assert_eq!(queue.shutdown().await.unwrap(), 3);
    assert_eq!(collector.items(), vec![1, 2, 3]);
    assert_eq!(queue.state(), QueueState::Stopped);
    assert_eq!(*state.borrow_and_update(), QueueState::Stopped);

    assert!(matches!(queue.try_add(4), Err(AddError::Closed { item: 4 })));
    assert!(matches!(queue.start(), Err(QueueError::Closed)));
    // idempotent, and watchers see no further transitions
    assert_eq!(queue.shutdown().await.unwrap(), 0);
    assert!(!state.has_changed().unwrap());
    assert_eq!(queue.state(), QueueState::Stopped);
}

#[tokio::test]
async fn shutdown_without_flush_discards() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(
        DeferredQueueConfig {
            flush_on_shutdown: false,
            ..config(60_000, 100)
        },
        &collector,
    );

    queue.add(1).await.unwrap();
    assert_eq!(queue.shutdown().await.unwrap(), 0);
    assert_eq!(collector.calls(), 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(60_000, 100), &collector);

    queue.start().unwrap();
    assert!(matches!(queue.start(), Err(QueueError::AlreadyStarted)));
    queue.shutdown().await.unwrap();
}

#[test]
fn start_outside_runtime_fails_cleanly() {
    let collector = Arc::new(Collector::default());
    let queue = queue_with(config(60_000, 100), &collector);
    assert!(matches!(queue.start(), Err(QueueError::NoRuntime)));
}

#[tokio::test]
async fn hosted_queue_flushes_on_host_stop() {
    let collector = Arc::new(Collector::default());
    let queue = Arc::new(queue_with(config(60_000, 100), &collector));

    let mut host = Host::new();
    host.add_service(queue.clone());
    let (_cancel, signal) = cancel_pair();

    host.start(&signal).await.unwrap();
    assert_eq!(queue.state(), QueueState::Running);

    queue.add(9).await.unwrap();
    host.stop(&signal).await.unwrap();

    assert_eq!(queue.state(), QueueState::Stopped);
    assert_eq!(collector.items(), vec![9]);
}
