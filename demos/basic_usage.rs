// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic deferred-queue usage example.
//!
//! Demonstrates:
//! 1. Hosting a queue backed by the in-memory bulk store
//! 2. Submitting inserts, upserts, updates and empty slots
//! 3. Count-threshold and timer flushes
//! 4. Observing validation rejections and backpressure
//! 5. Displaying captured metrics
//! 6. Clean shutdown with a final flush
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=deferred_queue=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use deferred_queue::{
    cancel_pair, DeferredQueue, DeferredQueueConfig, Entity, EntityBatchProcessor, Host,
    InMemoryBulkStore, ValidationError,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Order {
    id: Option<u64>,
    customer: String,
    total_cents: i64,
    /// Read back from the store, so already persisted
    loaded: bool,
}

impl Entity for Order {
    type Key = u64;

    fn key(&self) -> Option<u64> {
        self.id
    }

    fn is_from_store(&self) -> bool {
        self.loaded
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.total_cents < 0 {
            return Err(ValidationError::new("negative total"));
        }
        Ok(())
    }
}

fn order(id: Option<u64>, customer: &str, total_cents: i64) -> Order {
    Order {
        id,
        customer: customer.into(),
        total_cents,
        loaded: false,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           deferred-queue: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and host the queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring deferred queue...");

    let config = DeferredQueueConfig {
        name: "orders".into(),
        flush_ms: 250,
        flush_count: 4,
        max_pending: Some(16),
        ..Default::default()
    };

    let store = Arc::new(InMemoryBulkStore::<Order>::new());
    let (rejections_tx, mut rejections) = mpsc::channel(64);
    let processor = EntityBatchProcessor::<Order, _>::new(store.clone())
        .named("orders")
        .with_rejections(rejections_tx);
    let queue = Arc::new(DeferredQueue::<Option<Order>, _>::new(config, processor));

    let mut host = Host::new();
    host.add_service(queue.clone());
    let (_cancel, signal) = cancel_pair();
    host.start(&signal).await?;
    println!("   ✅ Queue '{}' state: {}", queue.name(), queue.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Submit a mixed batch (hits the count threshold)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Submitting 4 orders (count threshold = 4)...");
    queue.add(Some(order(None, "alice", 1_250))).await?; // insert
    queue.add(Some(order(Some(1), "bob", 990))).await?; // upsert
    queue.add(Some(order(Some(2), "carol", -5))).await?; // invalid upsert
    queue.add(None).await?; // skipped slot

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   └─ Keyed rows: {}, keyless rows: {}", store.len(), store.keyless().len());

    while let Ok(rejected) = rejections.try_recv() {
        println!(
            "   └─ ⚠️  Rejected order for {}: {}",
            rejected.item.customer, rejected.error
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Update an order read back from the store (timer flush)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏱️  Updating bob's order, waiting for the timer flush...");
    if let Some(mut existing) = store.get(&1) {
        existing.loaded = true;
        existing.total_cents += 500;
        queue.add(Some(existing)).await?;
    }
    println!("   └─ Pending: {}, backpressure: {}", queue.len(), queue.backpressure());

    tokio::time::sleep(Duration::from_millis(400)).await;
    if let Some(bob) = store.get(&1) {
        println!("   └─ bob's total is now {} cents", bob.total_cents);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Explicit flush
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚀 Explicit flush...");
    queue.add(Some(order(Some(3), "dave", 4_200))).await?;
    let rows = queue.flush().await?;
    println!("   └─ Rows affected: {}", rows);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Stats and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Queue Stats:");
    let stats = queue.stats();
    println!("   ┌─ Added:        {}", stats.added);
    println!("   ├─ Flushes:      {} ({} failed)", stats.flushes, stats.failed_flushes);
    println!("   ├─ Items:        {}", stats.items_flushed);
    println!("   └─ Rows:         {}", stats.rows_affected);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown (final flush)
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    queue.add(Some(order(None, "erin", 300))).await?;
    host.stop(&signal).await?;
    println!("   ✅ Shutdown complete! State: {}", queue.state());
    println!("   └─ Keyed rows: {}, keyless rows: {}", store.len(), store.keyless().len());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }

    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }

    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, avg) in &histograms {
            println!("      └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
}
