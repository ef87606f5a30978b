//! gpufleet - Kubernetes operator that turns GPU workloads into GPU-bound worker pods
//!
//! A `GpuWorkload` declares how many workers it wants and what share of a GPU
//! each one needs. The operator allocates GPUs from the referenced `GpuPool`,
//! launches one worker pod per replica pinned to the GPU's node, rolls workers
//! when the rendered template changes, and releases every GPU exactly once
//! when its worker goes away.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (GpuWorkload, GpuPool, Gpu)
//! - [`controller`] - Workload reconciliation (scaler, launcher, cleanup, status)
//! - [`allocator`] - GPU allocation against the Gpu inventory
//! - [`ports`] - Per-node host port allocation
//! - [`worker`] - Worker pod rendering and template hashing
//! - [`events`] - Kubernetes Event publishing
//! - [`metrics`] - OpenTelemetry instruments for scheduling and workers
//! - [`telemetry`] - Tracing and OTLP export setup
//! - [`config`] - Operator configuration (flags and environment)
//! - [`runner`] - Controller wiring for the kube runtime
//! - [`retry`] - Exponential backoff helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod allocator;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod ports;
pub mod retry;
pub mod runner;
pub mod telemetry;
pub mod worker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Pod and object vocabulary
// =============================================================================
// Labels, annotations and the finalizer form a stable contract with users and
// with other operator instances; changing any of them orphans existing pods.

/// Label keying a worker pod to its parent workload
pub const WORKLOAD_LABEL: &str = "gpufleet.dev/workload";

/// Label carrying the template hash a worker pod was rendered from
pub const POD_TEMPLATE_HASH_LABEL: &str = "gpufleet.dev/pod-template-hash";

/// Annotation listing the GPUs allocated to a worker pod, comma-separated
pub const GPUS_ANNOTATION: &str = "gpufleet.dev/gpus";

/// Annotation recording the host port reserved for a worker pod
pub const PORT_ANNOTATION: &str = "gpufleet.dev/port";

/// Annotation stamped with a fresh value when a pod's GPUs are released
pub const GPU_RELEASED_ANNOTATION: &str = "gpufleet.dev/gpu-released";

/// Finalizer blocking workload and worker pod deletion until GPUs are released
pub const FINALIZER: &str = "gpufleet.dev/gpu-cleanup";

/// Label on Gpu objects naming the node that hosts the device
pub const NODE_NAME_LABEL: &str = "gpufleet.dev/node-name";

/// Label on Gpu objects naming the pool the device belongs to
pub const POOL_LABEL: &str = "gpufleet.dev/pool";

/// Well-known node label used to pin worker pods to their GPU's node
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Field manager and event reporter name used for operator writes
pub const CONTROLLER_NAME: &str = "gpufleet-controller";

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// First host port handed to workers
pub const DEFAULT_PORT_RANGE_START: u16 = 42000;

/// Last host port handed to workers (inclusive)
pub const DEFAULT_PORT_RANGE_END: u16 = 62000;

/// Seconds to wait before re-checking pods that are still terminating
pub const DEFAULT_PENDING_REQUEUE_SECS: u64 = 3;

/// Seconds between refreshes of the GPU inventory
pub const DEFAULT_INVENTORY_REFRESH_SECS: u64 = 30;
