// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service host: ordered start/stop of named background services.
//!
//! The [`Host`] walks its services in registration order for both
//! [`start`](Host::start) and [`stop`](Host::stop). Before each step it checks
//! the cancellation signal; once cancelled, the remaining steps are skipped
//! and the steps already taken stay taken.
//!
//! OS integration (install, query running, …) goes through a
//! [`ServiceManager`]. The default [`NoopServiceManager`] answers `None`
//! ("cannot tell") to every query.
//!
//! # Example
//!
//! ```rust,no_run
//! use deferred_queue::{cancel_pair, DeferredQueue, DeferredQueueConfig, Host};
//! use deferred_queue::{EntityBatchProcessor, InMemoryBulkStore, Entity};
//! use std::sync::Arc;
//!
//! #[derive(Clone)]
//! struct Event { id: Option<u64> }
//! impl Entity for Event {
//!     type Key = u64;
//!     fn key(&self) -> Option<u64> { self.id }
//!     fn is_from_store(&self) -> bool { false }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let queue = Arc::new(DeferredQueue::<Event, _>::new(
//!     DeferredQueueConfig::default(),
//!     EntityBatchProcessor::<Event, _>::new(InMemoryBulkStore::<Event>::new()),
//! ));
//!
//! let mut host = Host::new();
//! host.add_service(queue.clone());
//!
//! let (_cancel, signal) = cancel_pair();
//! host.start(&signal).await.expect("start");
//! // ... run ...
//! host.stop(&signal).await.expect("stop");
//! # }
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Cancellation signal; `true` means cancelled.
pub type CancelSignal = watch::Receiver<bool>;

/// Create a cancellation sender and its signal.
///
/// `sender.send(true)` cancels every clone of the signal.
pub fn cancel_pair() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("{step} cancelled after {completed} of {total} services")]
    Cancelled {
        step: &'static str,
        completed: usize,
        total: usize,
    },
    #[error("service '{name}' failed: {message}")]
    Service { name: String, message: String },
}

impl HostError {
    pub fn service(name: &str, err: impl fmt::Display) -> Self {
        Self::Service {
            name: name.to_string(),
            message: err.to_string(),
        }
    }
}

/// A background service the [`Host`] can start and stop.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, cancel: &CancelSignal) -> Result<(), HostError>;
    async fn stop(&self, cancel: &CancelSignal) -> Result<(), HostError>;
}

/// OS service-manager integration points.
///
/// Queries return `None` when the platform cannot answer.
pub trait ServiceManager: Send + Sync {
    fn is_installed(&self, _service_name: &str) -> Option<bool> {
        None
    }

    fn is_running(&self, _service_name: &str) -> Option<bool> {
        None
    }

    fn install(&self, _service: &dyn HostedService) -> Result<(), HostError> {
        Ok(())
    }

    fn uninstall(&self, _service_name: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn start_service(&self, _service_name: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn stop_service(&self, _service_name: &str) -> Result<(), HostError> {
        Ok(())
    }
}

/// Manager for platforms without service integration
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopServiceManager;

impl ServiceManager for NoopServiceManager {}

#[derive(Clone, Copy)]
enum Step {
    Start,
    Stop,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Ordered collection of hosted services.
///
/// Dropping the host drops its references to the services.
pub struct Host {
    services: Vec<Arc<dyn HostedService>>,
    manager: Box<dyn ServiceManager>,
}

impl Host {
    #[must_use]
    pub fn new() -> Self {
        Self::with_manager(NoopServiceManager)
    }

    pub fn with_manager(manager: impl ServiceManager + 'static) -> Self {
        Self {
            services: Vec::new(),
            manager: Box::new(manager),
        }
    }

    pub fn add_service(&mut self, service: Arc<dyn HostedService>) {
        self.services.push(service);
    }

    #[must_use]
    pub fn services(&self) -> &[Arc<dyn HostedService>] {
        &self.services
    }

    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Arc<dyn HostedService>> {
        self.services.iter().find(|s| s.name() == name)
    }

    /// Start every service in registration order.
    #[tracing::instrument(skip_all)]
    pub async fn start(&self, cancel: &CancelSignal) -> Result<(), HostError> {
        self.run(Step::Start, cancel).await
    }

    /// Stop every service in registration order.
    #[tracing::instrument(skip_all)]
    pub async fn stop(&self, cancel: &CancelSignal) -> Result<(), HostError> {
        self.run(Step::Stop, cancel).await
    }

    async fn run(&self, step: Step, cancel: &CancelSignal) -> Result<(), HostError> {
        let total = self.services.len();
        info!(step = step.as_str(), total, "Host sequence starting");

        for (completed, service) in self.services.iter().enumerate() {
            if is_cancelled(cancel) {
                warn!(step = step.as_str(), completed, total, "Host sequence cancelled");
                return Err(HostError::Cancelled {
                    step: step.as_str(),
                    completed,
                    total,
                });
            }

            debug!(service = service.name(), step = step.as_str(), "Host step");
            let result = match step {
                Step::Start => service.start(cancel).await,
                Step::Stop => service.stop(cancel).await,
            };

            let status = if result.is_ok() { "success" } else { "error" };
            crate::metrics::record_service_step(service.name(), step.as_str(), status);
            result?;
        }

        info!(step = step.as_str(), total, "Host sequence complete");
        Ok(())
    }

    pub fn is_installed(&self, service_name: &str) -> Option<bool> {
        self.manager.is_installed(service_name)
    }

    pub fn is_running(&self, service_name: &str) -> Option<bool> {
        self.manager.is_running(service_name)
    }

    pub fn install(&self, service: &dyn HostedService) -> Result<(), HostError> {
        self.manager.install(service)
    }

    pub fn uninstall(&self, service_name: &str) -> Result<(), HostError> {
        self.manager.uninstall(service_name)
    }

    pub fn start_service(&self, service_name: &str) -> Result<(), HostError> {
        self.manager.start_service(service_name)
    }

    pub fn stop_service(&self, service_name: &str) -> Result<(), HostError> {
        self.manager.stop_service(service_name)
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}
