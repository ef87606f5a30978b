//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster and gpufleet resources.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use gpufleet::crd::{
    Gpu, GpuPhase, GpuPool, GpuPoolSpec, GpuSpec, GpuStatus, GpuWorkload, GpuWorkloadSpec,
    ResourceAmount, Resources, WorkerConfig,
};
use gpufleet::{NODE_NAME_LABEL, POOL_LABEL};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "gpufleet-integration-test";

/// The single kind node every worker lands on
pub const TEST_NODE: &str = "gpufleet-integration-test-control-plane";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRDs have been installed (async-safe)
static CRDS_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Apply the gpufleet CRDs
pub async fn install_crds(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("gpufleet-integration-test").force();

    for crd in [GpuWorkload::crd(), GpuPool::crd(), Gpu::crd()] {
        let name = crd.metadata.name.clone().unwrap();
        println!("Installing {name} CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }

    // Wait for CRDs to be established
    sleep(Duration::from_secs(2)).await;
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    // Install default crypto provider (required for rustls)
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRDS_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crds(&client)
                .await
                .map_err(|e| format!("failed to install CRDs: {e}"))
        })
        .await;
    crd_result.clone()?;

    Ok(client)
}

/// Create a namespace for one test, reusing it if it exists
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let mut ns = Namespace::default();
    ns.metadata.name = Some(name.to_string());
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A pool whose workers are pause containers
pub fn sample_pool(name: &str, image: &str) -> GpuPool {
    GpuPool::new(
        name,
        GpuPoolSpec {
            worker: WorkerConfig {
                template: serde_json::json!({
                    "spec": {
                        "containers": [{ "name": "worker", "image": image }],
                        "terminationGracePeriodSeconds": 0
                    }
                }),
            },
        },
    )
}

/// A workload asking for `replicas` workers of 10 TFLOPS / 1Gi each
pub fn sample_workload(name: &str, namespace: &str, pool: &str, replicas: i32) -> GpuWorkload {
    let mut workload = GpuWorkload::new(
        name,
        GpuWorkloadSpec {
            pool_name: pool.to_string(),
            replicas: Some(replicas),
            resources: Resources {
                requests: ResourceAmount::new("10", "1Gi"),
                limits: ResourceAmount::new("10", "1Gi"),
            },
            gpu_count: 1,
            gpu_model: None,
            node_affinity: None,
        },
    );
    workload.metadata.namespace = Some(namespace.to_string());
    workload
}

/// Register a Gpu on the kind node and mark it running
pub async fn create_gpu(client: &Client, name: &str, pool: &str) -> Result<Gpu, kube::Error> {
    let gpus: Api<Gpu> = Api::all(client.clone());
    let mut gpu = Gpu::new(name, GpuSpec::default());
    gpu.metadata.labels = Some(BTreeMap::from([
        (NODE_NAME_LABEL.to_string(), TEST_NODE.to_string()),
        (POOL_LABEL.to_string(), pool.to_string()),
    ]));
    let params = PatchParams::apply("gpufleet-integration-test").force();
    gpus.patch(name, &params, &Patch::Apply(&gpu)).await?;

    let status = serde_json::json!({
        "apiVersion": "gpufleet.dev/v1alpha1",
        "kind": "Gpu",
        "status": GpuStatus {
            phase: GpuPhase::Running,
            gpu_model: Some("A100".to_string()),
            capacity: ResourceAmount::new("10", "8Gi"),
            ..Default::default()
        }
    });
    gpus.patch_status(name, &params, &Patch::Apply(&status)).await
}

/// Poll `check` until it returns true or the timeout expires
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        sleep(Duration::from_millis(500)).await;
    }
    Err(format!("timed out waiting for {what}"))
}
