//! Shared state handed to every reconcile

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::Client;

use super::client::{KubeClient, KubeClientImpl};
use crate::allocator::{GpuAllocator, InventoryAllocator};
use crate::config::OperatorConfig;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::metrics::{OtelWorkerMetrics, WorkerMetrics};
use crate::ports::{HostPortAllocator, PortAllocator};
use crate::retry::RetryConfig;

/// Controller context containing shared state and clients
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// GPU allocator
    pub allocator: Arc<dyn GpuAllocator>,
    /// Host port allocator
    pub ports: Arc<dyn PortAllocator>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Scheduling and worker metrics
    pub metrics: Arc<dyn WorkerMetrics>,
    /// Delay before re-checking terminating workers or retrying allocation
    pub pending_requeue: Duration,
    /// Backoff applied by the error policy
    pub error_backoff: RetryConfig,
    /// Consecutive failures per workload key, reset on success
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        allocator: Arc<dyn GpuAllocator>,
        ports: Arc<dyn PortAllocator>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<dyn WorkerMetrics>,
    ) -> Self {
        Self {
            kube,
            allocator,
            ports,
            events,
            metrics,
            pending_requeue: Duration::from_secs(crate::DEFAULT_PENDING_REQUEUE_SECS),
            error_backoff: RetryConfig::reconcile_errors(),
            failures: DashMap::new(),
        }
    }

    /// Record a failed reconcile for `key`, returning the consecutive failure count
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget failures for `key` after a successful reconcile
    pub fn reset_failures(&self, key: &str) {
        self.failures.remove(key);
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(&config)
///     .allocator(inventory.clone())
///     .ports(ports.clone())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    kube: Option<Arc<dyn KubeClient>>,
    allocator: Option<Arc<dyn GpuAllocator>>,
    ports: Option<Arc<dyn PortAllocator>>,
    events: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Arc<dyn WorkerMetrics>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: OperatorConfig::default(),
            kube: None,
            allocator: None,
            ports: None,
            events: None,
            metrics: None,
        }
    }

    /// Use the given operator configuration
    pub fn config(mut self, config: &OperatorConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Use a shared GPU allocator
    pub fn allocator(mut self, allocator: Arc<dyn GpuAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Use a shared host port allocator
    pub fn ports(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the metrics sink
    pub fn metrics(mut self, metrics: Arc<dyn WorkerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let config = self.config;
        Context {
            kube: self.kube.unwrap_or_else(|| {
                Arc::new(KubeClientImpl::new(self.client.clone(), &config.field_manager))
            }),
            allocator: self
                .allocator
                .unwrap_or_else(|| Arc::new(InventoryAllocator::new())),
            ports: self.ports.unwrap_or_else(|| {
                Arc::new(HostPortAllocator::new(
                    config.port_range_start,
                    config.port_range_end,
                ))
            }),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), &config.field_manager))
            }),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(OtelWorkerMetrics::new())),
            pending_requeue: config.pending_requeue(),
            error_backoff: RetryConfig::reconcile_errors(),
            failures: DashMap::new(),
        }
    }
}
