//! Shared types used across gpufleet CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Keep the previous transition time when the status did not flip
    ///
    /// Kubernetes conventions only move `lastTransitionTime` on a status change;
    /// reason and message updates alone keep the old timestamp.
    pub fn carry_transition_time(mut self, previous: &[Condition]) -> Self {
        if let Some(prev) = previous
            .iter()
            .find(|c| c.type_ == self.type_ && c.status == self.status)
        {
            self.last_transition_time = prev.last_transition_time;
        }
        self
    }
}

/// Name and namespace of a namespaced object, used as the allocator's claim owner
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameNamespace {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

impl NameNamespace {
    /// Create a new name/namespace pair
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for NameNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Compute and memory amounts for a single GPU share
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAmount {
    /// Compute in TFLOPS (e.g., "20", "12.5")
    #[serde(default)]
    pub tflops: String,

    /// GPU memory (e.g., "16Gi", "512Mi"; bare numbers are MiB)
    #[serde(default)]
    pub vram: String,
}

impl ResourceAmount {
    /// Create a resource amount from tflops and vram strings
    pub fn new(tflops: impl Into<String>, vram: impl Into<String>) -> Self {
        Self {
            tflops: tflops.into(),
            vram: vram.into(),
        }
    }

    /// Parse the tflops field; an empty string means zero
    pub fn tflops_value(&self) -> Result<f64, String> {
        parse_tflops(&self.tflops)
    }

    /// Parse the vram field into MiB; an empty string means zero
    pub fn vram_mib(&self) -> Result<u64, String> {
        parse_vram_mib(&self.vram)
    }

    /// Validate both fields parse
    pub fn validate(&self, field: &str) -> Result<(), String> {
        self.tflops_value()
            .map_err(|e| format!("{field}.tflops: {e}"))?;
        self.vram_mib().map_err(|e| format!("{field}.vram: {e}"))?;
        Ok(())
    }
}

/// Per-worker requests and limits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Guaranteed share reserved from the allocator
    #[serde(default)]
    pub requests: ResourceAmount,

    /// Upper bound passed to the worker
    #[serde(default)]
    pub limits: ResourceAmount,
}

/// Placement constraints applied to GPU selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    /// Labels a GPU must carry to be eligible
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl NodeAffinity {
    /// Returns true if the given labels satisfy every required label
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Parse a TFLOPS amount. Empty means zero.
pub(crate) fn parse_tflops(value: &str) -> Result<f64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0.0);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(format!("invalid tflops: {value}")),
    }
}

/// Parse a GPU memory string into MiB.
///
/// Accepts "20Gi" → 20480, "512Mi" → 512, bare number → MiB. Empty means zero.
pub(crate) fn parse_vram_mib(memory: &str) -> Result<u64, String> {
    let memory = memory.trim();
    if memory.is_empty() {
        return Ok(0);
    }
    if let Some(num) = memory.strip_suffix("Gi") {
        num.parse::<u64>()
            .map(|n| n * 1024)
            .map_err(|_| format!("invalid vram: {memory}, use Gi or Mi suffix"))
    } else if let Some(num) = memory.strip_suffix("Mi") {
        num.parse::<u64>()
            .map_err(|_| format!("invalid vram: {memory}, use Gi or Mi suffix"))
    } else {
        memory
            .parse::<u64>()
            .map_err(|_| format!("invalid vram: {memory}, use Gi or Mi suffix"))
    }
}
