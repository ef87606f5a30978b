//! Integration tests for CRD operations
//!
//! These tests tell the story of how users interact with gpufleet resources
//! through the Kubernetes API.

use kube::api::{Api, DeleteParams, PostParams};
use kube::ResourceExt;

use gpufleet::crd::{GpuPool, GpuWorkload};

use super::helpers::{ensure_namespace, ensure_test_cluster, sample_pool, sample_workload};

/// Story: a user declares a workload and reads it back unchanged
///
/// Unset replicas stay unset on the server; the controller treats them as 1.
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_workload_round_trips_through_the_api() {
    let client = ensure_test_cluster().await.expect("test cluster");
    ensure_namespace(&client, "crd-ops").await.expect("namespace");
    let api: Api<GpuWorkload> = Api::namespaced(client, "crd-ops");

    let mut workload = sample_workload("round-trip", "crd-ops", "default", 1);
    workload.spec.replicas = None;
    let _ = api.delete("round-trip", &DeleteParams::default()).await;

    let created = api
        .create(&PostParams::default(), &workload)
        .await
        .expect("create workload");
    assert_eq!(created.spec.replicas, None);
    assert_eq!(created.spec.desired_replicas(), 1);
    assert_eq!(created.spec.gpu_count, 1);
    assert!(created.status.is_none());

    api.delete("round-trip", &DeleteParams::default())
        .await
        .expect("delete workload");
}

/// Story: a pool keeps an arbitrary pod template verbatim
///
/// The template is stored with unknown fields preserved, so any pod field
/// the worker needs survives the API server's pruning.
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_pool_template_is_not_pruned() {
    let client = ensure_test_cluster().await.expect("test cluster");
    let api: Api<GpuPool> = Api::all(client);

    let mut pool = sample_pool("crd-ops-pool", "registry.k8s.io/pause:3.9");
    pool.spec.worker.template["spec"]["priorityClassName"] = serde_json::json!("system-node-critical");
    let _ = api.delete("crd-ops-pool", &DeleteParams::default()).await;

    let created = api
        .create(&PostParams::default(), &pool)
        .await
        .expect("create pool");
    assert_eq!(created.name_any(), "crd-ops-pool");
    let template = created.spec.worker.pod_template().expect("template parses");
    let spec = template.spec.expect("pod spec");
    assert_eq!(spec.priority_class_name.as_deref(), Some("system-node-critical"));
    assert_eq!(spec.containers[0].image.as_deref(), Some("registry.k8s.io/pause:3.9"));

    api.delete("crd-ops-pool", &DeleteParams::default())
        .await
        .expect("delete pool");
}
