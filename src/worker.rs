//! Worker pod rendering and template hashing
//!
//! A [`WorkerGenerator`] is built from a pool's worker template. It is pure:
//! the same inputs always render the same pod and the same hash, so the
//! reconciler can tell outdated workers apart by their hash label alone.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ContainerPort, EnvVar, Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;

use crate::crd::{Gpu, GpuPool, GpuWorkloadSpec, ResourceAmount};
use crate::{Error, Result, HOSTNAME_LABEL, PORT_ANNOTATION, POD_TEMPLATE_HASH_LABEL};

/// Alphabet used for generated name suffixes (no vowels, no confusable digits)
const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Length of the random suffix on worker pod names
const NAME_SUFFIX_LEN: usize = 5;

/// Name of the container port the worker server listens on
pub const WORKER_PORT_NAME: &str = "worker";

/// Environment variables injected into every worker container
pub mod env {
    /// Comma-separated GPU names
    pub const GPUS: &str = "GPUFLEET_GPUS";
    /// Owning workload name
    pub const WORKLOAD: &str = "GPUFLEET_WORKLOAD";
    /// Owning workload namespace
    pub const NAMESPACE: &str = "GPUFLEET_NAMESPACE";
    /// Reserved host port
    pub const WORKER_PORT: &str = "GPUFLEET_WORKER_PORT";
    /// Requested TFLOPS per GPU
    pub const TFLOPS_REQUEST: &str = "GPUFLEET_TFLOPS_REQUEST";
    /// Requested memory per GPU
    pub const VRAM_REQUEST: &str = "GPUFLEET_VRAM_REQUEST";
    /// TFLOPS limit per GPU
    pub const TFLOPS_LIMIT: &str = "GPUFLEET_TFLOPS_LIMIT";
    /// Memory limit per GPU
    pub const VRAM_LIMIT: &str = "GPUFLEET_VRAM_LIMIT";
    /// Hash of the template the worker was rendered from
    pub const POD_TEMPLATE_HASH: &str = "GPUFLEET_POD_TEMPLATE_HASH";
}

/// Everything [`WorkerGenerator::generate_worker_pod`] needs about one worker
#[derive(Clone, Debug)]
pub struct WorkerParams<'a> {
    /// GPUs allocated to the worker, all on one node
    pub gpus: &'a [Gpu],
    /// Owning workload name
    pub workload: &'a str,
    /// Pod name
    pub name: &'a str,
    /// Pod namespace
    pub namespace: &'a str,
    /// Reserved host port
    pub port: u16,
    /// Per-GPU requests
    pub requests: &'a ResourceAmount,
    /// Per-GPU limits
    pub limits: &'a ResourceAmount,
    /// Template hash to stamp
    pub hash: &'a str,
}

/// Renders worker pods from a pool's template
#[derive(Clone, Debug)]
pub struct WorkerGenerator {
    raw_template: serde_json::Value,
    template: PodTemplateSpec,
}

impl WorkerGenerator {
    /// Build a generator from the pool's worker configuration
    pub fn for_pool(pool: &GpuPool) -> Result<Self> {
        Ok(Self {
            raw_template: pool.spec.worker.template.clone(),
            template: pool.spec.worker.pod_template()?,
        })
    }

    /// Fingerprint of everything that shapes a rendered worker
    ///
    /// `replicas` is not part of the hash: scaling must never roll workers.
    pub fn pod_template_hash(&self, spec: &GpuWorkloadSpec) -> Result<String> {
        // serde_json maps are ordered, so this serialization is canonical
        let input = serde_json::json!({
            "template": self.raw_template,
            "poolName": spec.pool_name,
            "resources": spec.resources,
            "gpuCount": spec.gpu_count,
            "gpuModel": spec.gpu_model,
            "nodeAffinity": spec.node_affinity,
        });
        Ok(deterministic_hash(&serde_json::to_string(&input)?))
    }

    /// Render a worker pod bound to `params.gpus`
    ///
    /// The pod is pinned to the node of the first GPU, carries the hash label
    /// and exposes the reserved port. Ownership metadata is added by the caller.
    pub fn generate_worker_pod(&self, params: &WorkerParams<'_>) -> Result<Pod> {
        let node = params
            .gpus
            .first()
            .and_then(Gpu::node_name)
            .ok_or_else(|| Error::validation("worker needs at least one GPU with a node"))?;

        let mut spec = self.template.spec.clone().unwrap_or_default();
        if spec.containers.is_empty() {
            return Err(Error::validation("worker template has no containers"));
        }

        let gpu_names = params.gpus.iter().map(|g| g.name_any()).collect::<Vec<_>>().join(",");
        let vars = [
            (env::GPUS, gpu_names),
            (env::WORKLOAD, params.workload.to_string()),
            (env::NAMESPACE, params.namespace.to_string()),
            (env::WORKER_PORT, params.port.to_string()),
            (env::TFLOPS_REQUEST, params.requests.tflops.clone()),
            (env::VRAM_REQUEST, params.requests.vram.clone()),
            (env::TFLOPS_LIMIT, params.limits.tflops.clone()),
            (env::VRAM_LIMIT, params.limits.vram.clone()),
            (env::POD_TEMPLATE_HASH, params.hash.to_string()),
        ];
        for container in spec.containers.iter_mut() {
            let container_env = container.env.get_or_insert_with(Vec::new);
            container_env.retain(|e| !vars.iter().any(|(name, _)| *name == e.name));
            container_env.extend(vars.iter().map(|(name, value)| EnvVar {
                name: name.to_string(),
                value: Some(value.clone()),
                value_from: None,
            }));
        }

        let ports = spec.containers[0].ports.get_or_insert_with(Vec::new);
        ports.retain(|p| p.name.as_deref() != Some(WORKER_PORT_NAME));
        ports.push(ContainerPort {
            name: Some(WORKER_PORT_NAME.to_string()),
            container_port: i32::from(params.port),
            host_port: Some(i32::from(params.port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });

        spec.node_selector
            .get_or_insert_with(BTreeMap::new)
            .insert(HOSTNAME_LABEL.to_string(), node);

        let template_meta = self.template.metadata.clone().unwrap_or_default();
        let mut labels = template_meta.labels.unwrap_or_default();
        labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), params.hash.to_string());

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(params.name.to_string()),
                namespace: Some(params.namespace.to_string()),
                labels: Some(labels),
                annotations: template_meta.annotations,
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        })
    }

    /// Host port recorded on a worker pod
    pub fn worker_port(pod: &Pod) -> Result<u16> {
        let raw = pod
            .annotations()
            .get(PORT_ANNOTATION)
            .ok_or_else(|| Error::validation(format!("pod {} has no port annotation", pod.name_any())))?;
        raw.trim().parse().map_err(|_| {
            Error::validation(format!("pod {} has invalid port annotation {raw:?}", pod.name_any()))
        })
    }
}

/// Name for a new worker: `<workload>-<5 random characters>`
pub fn worker_name(workload: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| char::from(NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())]))
        .collect();
    format!("{workload}-{suffix}")
}

/// Compute a deterministic hash of the input string
///
/// SHA-256 truncated to 8 bytes (16 hex chars), compact enough for a label.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
