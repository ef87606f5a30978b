//! Custom Resource Definitions for gpufleet
//!
//! This module contains all CRD definitions used by the gpufleet operator.

mod gpu;
mod pool;
mod types;
mod workload;

pub use gpu::{Gpu, GpuPhase, GpuSpec, GpuStatus};
pub use pool::{GpuPool, GpuPoolSpec, WorkerConfig};
pub use types::{
    Condition, ConditionStatus, NameNamespace, NodeAffinity, ResourceAmount, Resources,
};
pub use workload::{
    GpuWorkload, GpuWorkloadSpec, GpuWorkloadStatus, WorkerPhase, WorkerStatus, WorkloadPhase,
};
