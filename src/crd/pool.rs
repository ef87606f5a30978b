//! GpuPool Custom Resource Definition
//!
//! A GpuPool names a set of GPUs (those labeled with the pool name) and
//! carries the pod template every worker in the pool is rendered from.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Raw pod templates are stored verbatim; the API server must not prune them.
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Specification for a GpuPool
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gpufleet.dev",
    version = "v1alpha1",
    kind = "GpuPool",
    plural = "gpupools",
    shortname = "gp",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuPoolSpec {
    /// How workers in this pool are materialized
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Worker materialization settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Pod template (a core/v1 PodTemplateSpec) each worker is rendered from
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: serde_json::Value,
}

impl WorkerConfig {
    /// Decode the raw template into a typed PodTemplateSpec
    ///
    /// A missing template decodes to an empty spec so the failure surfaces
    /// where the pod is created, with the API server's message.
    pub fn pod_template(&self) -> Result<PodTemplateSpec, crate::Error> {
        if self.template.is_null() {
            return Ok(PodTemplateSpec::default());
        }
        serde_json::from_value(self.template.clone()).map_err(|e| {
            crate::Error::serialization(format!("invalid worker template: {e}"))
        })
    }
}
