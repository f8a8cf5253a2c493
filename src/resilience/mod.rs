//! Resilience helpers: bounded retry around batch processing.

pub mod retry;

pub use retry::{retry, retry_if, RetryConfig, RetryingProcessor, DEFAULT_MAX_ATTEMPTS};
