// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! The queue never retries a failed batch on its own. Wrap a processor in
//! [`RetryingProcessor`] to retry transient failures a bounded number of
//! times before the batch is given up. A batch that failed after part of it
//! was committed ([`ProcessError::is_partial`]) is never re-run.
//!
//! # Example
//!
//! ```
//! use deferred_queue::RetryConfig;
//!
//! // Flush: a few quick attempts, then give up on the batch
//! let flush = RetryConfig::flush();
//! assert_eq!(flush.max_retries, Some(3));
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::processor::{BatchProcessor, ProcessError};

/// Attempts allowed when a processor is given an unbounded config
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Configuration for operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first; `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::flush()
    }
}

impl RetryConfig {
    /// Quick retry for batch flushes (don't stall the flush loop).
    /// 3 attempts with fast backoff, then the batch is reported as failed.
    #[must_use]
    pub fn flush() -> Self {
        Self {
            max_retries: Some(DEFAULT_MAX_ATTEMPTS),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before the attempt following `delay`
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Like [`retry`], but gives up at once on an error `should_retry` rejects.
pub async fn retry_if<F, Fut, T, E, R>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    warn!(
                        "Operation '{}' failed (attempt {}) with a non-retryable error: {}",
                        operation_name, attempts, err
                    );
                    return Err(err);
                }

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                crate::metrics::record_retry(operation_name);
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Processor wrapper that retries failed batches with backoff.
///
/// Always bounded: a config without `max_retries` is capped at
/// [`DEFAULT_MAX_ATTEMPTS`] so a batch that can never succeed is eventually
/// dropped instead of stalling the queue. Requires `T: Clone` since each
/// attempt consumes its own copy of the batch.
///
/// Errors where part of the batch already committed
/// ([`ProcessError::is_partial`]) are returned without retrying, since
/// re-running the batch would write the committed part again.
pub struct RetryingProcessor<P> {
    inner: P,
    config: RetryConfig,
}

impl<P> RetryingProcessor<P> {
    pub fn new(inner: P, mut config: RetryConfig) -> Self {
        if config.max_retries.is_none() {
            warn!(
                cap = DEFAULT_MAX_ATTEMPTS,
                "Unbounded retry config given to RetryingProcessor, capping attempts"
            );
            config.max_retries = Some(DEFAULT_MAX_ATTEMPTS);
        }
        Self { inner, config }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl<T, P> BatchProcessor<T> for RetryingProcessor<P>
where
    T: Clone + Send + Sync + 'static,
    P: BatchProcessor<T>,
{
    async fn process(&self, batch: Vec<T>) -> Result<usize, ProcessError> {
        retry_if(
            "process_batch",
            &self.config,
            |err: &ProcessError| !err.is_partial(),
            || self.inner.process(batch.clone()),
        )
        .await
    }
}
