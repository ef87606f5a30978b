//! Gpu Custom Resource Definition
//!
//! One Gpu object per physical device, published by the node agents. The
//! operator only reads them: they are the inventory the allocator hands out.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ResourceAmount;
use crate::{HOSTNAME_LABEL, NODE_NAME_LABEL, POOL_LABEL};

/// Specification for a Gpu
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gpufleet.dev",
    version = "v1alpha1",
    kind = "Gpu",
    plural = "gpus",
    status = "GpuStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".status.gpuModel"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"TFLOPS","type":"string","jsonPath":".status.capacity.tflops"}"#,
    printcolumn = r#"{"name":"VRAM","type":"string","jsonPath":".status.capacity.vram"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuSpec {}

/// Device health as reported by the node agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GpuPhase {
    /// Not yet reported
    #[default]
    Pending,
    /// Healthy and schedulable
    Running,
    /// Unhealthy; never allocated
    Failed,
}

/// Status for a Gpu
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatus {
    /// Device phase
    #[serde(default)]
    pub phase: GpuPhase,

    /// Node selector that pins a pod to this device's node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Device model (e.g., "A100")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,

    /// Total compute and memory of the device
    #[serde(default)]
    pub capacity: ResourceAmount,
}

impl Gpu {
    /// Node hosting this GPU, from the node-name label or the hostname selector
    pub fn node_name(&self) -> Option<String> {
        if let Some(node) = self.labels().get(NODE_NAME_LABEL) {
            return Some(node.clone());
        }
        self.status
            .as_ref()
            .and_then(|s| s.node_selector.get(HOSTNAME_LABEL))
            .cloned()
    }

    /// Pool this GPU belongs to
    pub fn pool(&self) -> Option<&str> {
        self.labels().get(POOL_LABEL).map(String::as_str)
    }

    /// Device model, if reported
    pub fn model(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.gpu_model.as_deref())
    }

    /// Whether the device is healthy enough to allocate
    pub fn is_running(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == GpuPhase::Running)
    }
}
