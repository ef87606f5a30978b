//! Integration tests for the workload reconciler
//!
//! These tests drive `reconcile` directly against a kind API server so each
//! step of a workload's life can be asserted without racing a background
//! controller.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};

use gpufleet::allocator::InventoryAllocator;
use gpufleet::controller::{reconcile, Context};
use gpufleet::crd::{GpuPool, GpuWorkload, WorkloadPhase};
use gpufleet::{FINALIZER, GPUS_ANNOTATION, POD_TEMPLATE_HASH_LABEL, PORT_ANNOTATION, WORKLOAD_LABEL};

use super::helpers::{
    create_gpu, ensure_namespace, ensure_test_cluster, sample_pool, sample_workload, wait_for,
    TEST_NODE,
};

const NAMESPACE: &str = "workload-lifecycle";

fn worker_pool(name: &str) -> GpuPool {
    let mut pool = sample_pool(name, "registry.k8s.io/pause:3.9");
    // kind runs a single control-plane node
    pool.spec.worker.template["spec"]["tolerations"] = serde_json::json!([{
        "key": "node-role.kubernetes.io/control-plane",
        "operator": "Exists",
        "effect": "NoSchedule"
    }]);
    pool
}

/// Each story gets its own pool and GPU so stories can run in parallel
async fn setup(client: &Client, pool: &str, gpu: &str) -> Arc<InventoryAllocator> {
    ensure_namespace(client, NAMESPACE).await.expect("namespace");
    create_gpu(client, gpu, pool).await.expect("gpu");

    let pools: Api<GpuPool> = Api::all(client.clone());
    let _ = pools.delete(pool, &DeleteParams::default()).await;
    pools
        .create(&PostParams::default(), &worker_pool(pool))
        .await
        .expect("pool");

    let allocator = Arc::new(InventoryAllocator::new());
    allocator.sync_from_cluster(client).await.expect("inventory");
    allocator
}

fn context(client: &Client, allocator: Arc<InventoryAllocator>) -> Arc<Context> {
    Arc::new(Context::builder(client.clone()).allocator(allocator).build())
}

/// Run reconcile cycles against the latest copy of the workload
async fn reconcile_cycles(client: &Client, ctx: &Arc<Context>, name: &str, cycles: usize) {
    let api: Api<GpuWorkload> = Api::namespaced(client.clone(), NAMESPACE);
    for _ in 0..cycles {
        let Some(workload) = api.get_opt(name).await.expect("get workload") else {
            return;
        };
        reconcile(Arc::new(workload), ctx.clone())
            .await
            .expect("reconcile");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

async fn worker_pods(client: &Client, workload: &str) -> Vec<Pod> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), NAMESPACE);
    pods.list(&ListParams::default().labels(&format!("{WORKLOAD_LABEL}={workload}")))
        .await
        .expect("list pods")
        .items
}

/// Story: a new workload gets one worker pinned to the GPU's node
///
/// The worker carries everything a restarted operator needs to rebuild its
/// reservations: the GPU names, the host port and the template hash.
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_workload_launches_annotated_worker() {
    let client = ensure_test_cluster().await.expect("test cluster");
    let (pool, gpu) = ("launch-pool", "launch-gpu-0");
    let allocator = setup(&client, pool, gpu).await;
    let ctx = context(&client, allocator.clone());

    let api: Api<GpuWorkload> = Api::namespaced(client.clone(), NAMESPACE);
    let workload = sample_workload("launch", NAMESPACE, pool, 1);
    api.create(&PostParams::default(), &workload)
        .await
        .expect("create workload");

    reconcile_cycles(&client, &ctx, "launch", 3).await;

    let pods = worker_pods(&client, "launch").await;
    assert_eq!(pods.len(), 1, "exactly one worker per replica");
    let pod = &pods[0];
    assert_eq!(pod.annotations().get(GPUS_ANNOTATION).map(String::as_str), Some(gpu));
    assert!(pod.annotations().contains_key(PORT_ANNOTATION));
    assert!(pod.labels().contains_key(POD_TEMPLATE_HASH_LABEL));
    assert!(pod.finalizers().iter().any(|f| f == FINALIZER));
    assert_eq!(
        pod.owner_references().first().map(|o| o.kind.as_str()),
        Some("GpuWorkload")
    );
    let selector = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_selector.clone())
        .unwrap_or_default();
    assert_eq!(selector.get("kubernetes.io/hostname").map(String::as_str), Some(TEST_NODE));

    let stored = api.get("launch").await.expect("get workload");
    assert!(stored.finalizers().iter().any(|f| f == FINALIZER));

    // Wait for the pause container, then let status catch up
    let client_ref = &client;
    wait_for("worker ready", Duration::from_secs(90), || async move {
        worker_pods(client_ref, "launch").await.iter().any(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        })
    })
    .await
    .expect("worker becomes ready");
    reconcile_cycles(&client, &ctx, "launch", 2).await;

    let status = api
        .get("launch")
        .await
        .expect("get workload")
        .status
        .expect("status written");
    assert_eq!(status.replicas, 1);
    assert_eq!(status.ready_replicas, 1);
    assert_eq!(status.phase, WorkloadPhase::Running);
    assert_eq!(status.worker_statuses.len(), 1);

    // Leave the cluster clean for the next story
    api.delete("launch", &DeleteParams::default())
        .await
        .expect("delete workload");
    reconcile_cycles(&client, &ctx, "launch", 10).await;
}

/// Story: deleting a workload drains its workers and frees the GPU
///
/// Worker and workload finalizers are only lifted once the GPU claim is
/// released, so the object disappears last.
#[tokio::test]
#[ignore = "requires kind cluster"]
async fn story_deleted_workload_releases_gpu() {
    let client = ensure_test_cluster().await.expect("test cluster");
    let (pool, gpu) = ("drain-pool", "drain-gpu-0");
    let allocator = setup(&client, pool, gpu).await;
    let ctx = context(&client, allocator.clone());
    let (free_tflops, _) = allocator.free_capacity(gpu).expect("gpu known");

    let api: Api<GpuWorkload> = Api::namespaced(client.clone(), NAMESPACE);
    let workload = sample_workload("drain", NAMESPACE, pool, 1);
    api.create(&PostParams::default(), &workload)
        .await
        .expect("create workload");

    reconcile_cycles(&client, &ctx, "drain", 3).await;
    assert_eq!(worker_pods(&client, "drain").await.len(), 1);
    let (claimed_tflops, _) = allocator.free_capacity(gpu).expect("gpu known");
    assert!(claimed_tflops < free_tflops, "worker claims GPU capacity");

    api.delete("drain", &DeleteParams::default())
        .await
        .expect("delete workload");

    let ctx_ref = &ctx;
    let client_ref = &client;
    wait_for("workload removed", Duration::from_secs(60), || async move {
        reconcile_cycles(client_ref, ctx_ref, "drain", 1).await;
        Api::<GpuWorkload>::namespaced(client_ref.clone(), NAMESPACE)
            .get_opt("drain")
            .await
            .expect("get workload")
            .is_none()
    })
    .await
    .expect("workload deleted after cleanup");

    assert!(worker_pods(&client, "drain").await.is_empty());
    let (released_tflops, _) = allocator.free_capacity(gpu).expect("gpu known");
    assert_eq!(released_tflops, free_tflops, "GPU fully released");
}
