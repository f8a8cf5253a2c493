// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for deferred queues.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `deferred_queue_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `queue`: queue name from config (entity processor metrics use the processor name)
//! - `reason`: time, count, manual, shutdown
//! - `status`: success, error
//! - `intent`: update, insert, upsert

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an accepted item
pub fn record_item_added(queue: &str) {
    counter!("deferred_queue_items_added_total", "queue" => queue.to_string()).increment(1);
}

/// Record an item refused by backpressure or a closed queue
pub fn record_item_rejected(queue: &str, cause: &str) {
    counter!(
        "deferred_queue_items_rejected_total",
        "queue" => queue.to_string(),
        "cause" => cause.to_string()
    )
    .increment(1);
}

/// Record a completed flush
pub fn record_flush(queue: &str, reason: &str, status: &str) {
    counter!(
        "deferred_queue_flushes_total",
        "queue" => queue.to_string(),
        "reason" => reason.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record flush duration
pub fn record_flush_latency(queue: &str, duration: Duration) {
    histogram!("deferred_queue_flush_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

/// Record items per flush
pub fn record_batch_size(queue: &str, count: usize) {
    histogram!("deferred_queue_batch_size", "queue" => queue.to_string()).record(count as f64);
}

/// Record age of the oldest item at flush time
pub fn record_batch_age(queue: &str, age: Duration) {
    histogram!("deferred_queue_batch_age_seconds", "queue" => queue.to_string())
        .record(age.as_secs_f64());
}

/// Record rows reported by the processor
pub fn record_rows_affected(queue: &str, rows: usize) {
    counter!("deferred_queue_rows_affected_total", "queue" => queue.to_string())
        .increment(rows as u64);
}

/// Record items lost because shutdown was configured not to flush
pub fn record_items_discarded(queue: &str, count: usize) {
    counter!("deferred_queue_items_discarded_total", "queue" => queue.to_string())
        .increment(count as u64);
}

/// Set current pending item count
pub fn set_pending_items(queue: &str, count: usize) {
    gauge!("deferred_queue_pending_items", "queue" => queue.to_string()).set(count as f64);
}

/// Set backpressure level (0 = Normal, 1 = Warn, 2 = Critical, 3 = Full)
pub fn set_backpressure_level(queue: &str, level: u8) {
    gauge!("deferred_queue_backpressure_level", "queue" => queue.to_string()).set(level as f64);
}

/// Record one bulk dispatch by the entity processor
pub fn record_dispatch(queue: &str, intent: &str, status: &str) {
    counter!(
        "deferred_queue_dispatches_total",
        "queue" => queue.to_string(),
        "intent" => intent.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an upsert dropped by validation
pub fn record_validation_skip(queue: &str) {
    counter!("deferred_queue_validation_skips_total", "queue" => queue.to_string()).increment(1);
}

/// Record a retried processor attempt
pub fn record_retry(operation: &str) {
    counter!("deferred_queue_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a hosted service step
pub fn record_service_step(service: &str, step: &str, status: &str) {
    counter!(
        "deferred_queue_host_steps_total",
        "service" => service.to_string(),
        "step" => step.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// RAII timer that records flush latency on drop
pub struct LatencyTimer {
    queue: String,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_flush_latency(&self.queue, self.start.elapsed());
    }
}
