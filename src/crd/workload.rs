//! GpuWorkload Custom Resource Definition
//!
//! A GpuWorkload declares a number of worker replicas, each bound to
//! `gpuCount` GPUs allocated from a named GpuPool. The controller owns the
//! status subresource; everything in it is derived from observed worker pods.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NodeAffinity, Resources};

fn default_gpu_count() -> u32 {
    1
}

/// Specification for a GpuWorkload
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gpufleet.dev",
    version = "v1alpha1",
    kind = "GpuWorkload",
    plural = "gpuworkloads",
    shortname = "gw",
    namespaced,
    status = "GpuWorkloadStatus",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolName"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuWorkloadSpec {
    /// Name of the GpuPool to allocate GPUs from
    pub pool_name: String,

    /// Desired number of workers (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Per-worker GPU compute and memory requests/limits
    #[serde(default)]
    pub resources: Resources,

    /// GPUs bound to each worker
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,

    /// Only allocate GPUs of this model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,

    /// Only allocate GPUs whose labels match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
}

impl GpuWorkloadSpec {
    /// Desired replica count, defaulting to 1 when unset
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Validate the workload specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.pool_name.trim().is_empty() {
            return Err(crate::Error::validation("poolName must not be empty"));
        }
        if self.gpu_count == 0 {
            return Err(crate::Error::validation("gpuCount must be at least 1"));
        }
        if self.desired_replicas() < 0 {
            return Err(crate::Error::validation("replicas must not be negative"));
        }
        self.resources
            .requests
            .validate("resources.requests")
            .map_err(crate::Error::validation)?;
        self.resources
            .limits
            .validate("resources.limits")
            .map_err(crate::Error::validation)?;
        Ok(())
    }
}

/// Lifecycle phase of a GpuWorkload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Waiting for workers to become ready
    #[default]
    Pending,
    /// All desired workers are ready
    Running,
    /// At least one worker failed
    Failed,
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Phase of a single worker, derived from its pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Pod is not yet running and ready
    #[default]
    Pending,
    /// Pod is running and ready
    Running,
    /// Pod failed
    Failed,
}

/// Observed state of one worker pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    /// Worker phase
    pub worker_phase: WorkerPhase,

    /// Pod name
    pub worker_name: String,

    /// Pod IP (empty until assigned)
    #[serde(default)]
    pub worker_ip: String,

    /// Host port reserved for the worker
    pub worker_port: u16,

    /// Node selector the worker pod was rendered with
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Resource version of the pod when this status was derived
    #[serde(default)]
    pub resource_version: String,
}

/// Status for a GpuWorkload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuWorkloadStatus {
    /// Number of worker pods that currently exist
    #[serde(default)]
    pub replicas: i32,

    /// Number of workers running and ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Current phase of the workload
    #[serde(default)]
    pub phase: WorkloadPhase,

    /// Conditions representing the workload state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Hash of the worker template last materialized
    #[serde(default)]
    pub pod_template_hash: String,

    /// One entry per non-terminating worker pod
    ///
    /// Always serialized so a merge patch clears the list when workers go away.
    #[serde(default)]
    pub worker_statuses: Vec<WorkerStatus>,
}
