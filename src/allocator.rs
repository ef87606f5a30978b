//! GPU allocation against the Gpu inventory
//!
//! The reconciler only sees [`GpuAllocator`]. [`InventoryAllocator`] is the
//! in-process implementation: it mirrors `Gpu` objects from the cluster and
//! keeps the claim each worker pod holds on each device. A claim is keyed by
//! the pod, so releasing the same pod twice cannot free a sibling's share.
//! Claims live only in memory and are rebuilt from worker pod annotations at
//! startup.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::crd::{Gpu, GpuWorkload, NameNamespace, NodeAffinity, ResourceAmount};
use crate::{Error, Result, GPUS_ANNOTATION, WORKLOAD_LABEL};

const TFLOPS_EPSILON: f64 = 1e-9;

/// One request for GPUs on behalf of a workload worker
#[derive(Clone, Debug, PartialEq)]
pub struct AllocRequest {
    /// Pool to allocate from
    pub pool_name: String,
    /// Workload holding the claim
    pub workload: NameNamespace,
    /// Worker pod the GPUs are reserved for, in the workload's namespace
    pub worker: String,
    /// Share of each GPU reserved for the worker
    pub request: ResourceAmount,
    /// Number of GPUs, all on one node
    pub count: u32,
    /// Restrict to this model
    pub gpu_model: Option<String>,
    /// Restrict to GPUs carrying these labels
    pub node_affinity: Option<NodeAffinity>,
}

impl AllocRequest {
    /// Build the request for worker pod `worker` of `workload`
    pub fn for_worker(workload: &GpuWorkload, worker: &str) -> Self {
        Self {
            pool_name: workload.spec.pool_name.clone(),
            workload: NameNamespace::new(workload.name_any(), workload.namespace().unwrap_or_default()),
            worker: worker.to_string(),
            request: workload.spec.resources.requests.clone(),
            count: workload.spec.gpu_count,
            gpu_model: workload.spec.gpu_model.clone(),
            node_affinity: workload.spec.node_affinity.clone(),
        }
    }
}

/// GPU reservation contract consumed by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GpuAllocator: Send + Sync {
    /// Reserve `count` GPUs on a single node. On error nothing is reserved.
    async fn alloc(&self, request: &AllocRequest) -> Result<Vec<Gpu>>;

    /// Release the worker's share on the named GPUs. Unknown claims are ignored.
    async fn dealloc(
        &self,
        workload: &NameNamespace,
        worker: &str,
        request: &ResourceAmount,
        gpus: &[String],
    ) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Claim {
    tflops: f64,
    vram_mib: u64,
}

/// Claim key: owning workload and the worker pod name
type ClaimKey = (NameNamespace, String);

#[derive(Clone, Debug)]
struct Device {
    gpu: Gpu,
    capacity_tflops: f64,
    capacity_vram_mib: u64,
    claims: BTreeMap<ClaimKey, Claim>,
}

impl Device {
    fn new(gpu: Gpu) -> Self {
        let capacity = gpu.status.as_ref().map(|s| s.capacity.clone()).unwrap_or_default();
        Self {
            capacity_tflops: capacity.tflops_value().unwrap_or_default(),
            capacity_vram_mib: capacity.vram_mib().unwrap_or_default(),
            gpu,
            claims: BTreeMap::new(),
        }
    }

    fn free(&self) -> (f64, u64) {
        let (tflops, vram) = self
            .claims
            .values()
            .fold((0.0, 0u64), |(t, v), c| (t + c.tflops, v + c.vram_mib));
        (
            self.capacity_tflops - tflops,
            self.capacity_vram_mib.saturating_sub(vram),
        )
    }

    fn fits(&self, tflops: f64, vram_mib: u64) -> bool {
        let (free_tflops, free_vram) = self.free();
        free_tflops + TFLOPS_EPSILON >= tflops && free_vram >= vram_mib
    }

    fn eligible(&self, request: &AllocRequest) -> bool {
        if self.gpu.pool() != Some(request.pool_name.as_str()) || !self.gpu.is_running() {
            return false;
        }
        if let Some(model) = &request.gpu_model {
            if self.gpu.model() != Some(model.as_str()) {
                return false;
            }
        }
        if let Some(affinity) = &request.node_affinity {
            if !affinity.matches(self.gpu.labels()) {
                return false;
            }
        }
        true
    }

    fn claim(&mut self, workload: &NameNamespace, worker: &str, tflops: f64, vram_mib: u64) {
        self.claims
            .insert((workload.clone(), worker.to_string()), Claim { tflops, vram_mib });
    }

    /// Returns false when the worker holds no claim on this device
    fn release(&mut self, workload: &NameNamespace, worker: &str) -> bool {
        self.claims
            .remove(&(workload.clone(), worker.to_string()))
            .is_some()
    }
}

/// First-fit allocator over an in-memory copy of the Gpu inventory
#[derive(Default)]
pub struct InventoryAllocator {
    devices: Mutex<BTreeMap<String, Device>>,
}

impl InventoryAllocator {
    /// Create an allocator with an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory with `gpus`, keeping claims on devices that remain
    pub fn sync(&self, gpus: Vec<Gpu>) {
        let mut devices = self.devices.lock();
        let mut next = BTreeMap::new();
        for gpu in gpus {
            let name = gpu.name_any();
            let mut device = Device::new(gpu);
            if let Some(previous) = devices.remove(&name) {
                device.claims = previous.claims;
            }
            next.insert(name, device);
        }
        for (name, gone) in devices.iter() {
            if !gone.claims.is_empty() {
                warn!(gpu = %name, claims = gone.claims.len(), "GPU left the inventory while claimed");
            }
        }
        *devices = next;
    }

    /// Refresh the inventory from the cluster's Gpu objects
    pub async fn sync_from_cluster(&self, client: &Client) -> Result<()> {
        let api: Api<Gpu> = Api::all(client.clone());
        let gpus = api.list(&ListParams::default()).await?.items;
        debug!(count = gpus.len(), "Synced GPU inventory");
        self.sync(gpus);
        Ok(())
    }

    /// Rebuild claims from worker pods that still hold GPUs
    ///
    /// Pods whose workload is gone still hold their GPUs until their cleanup
    /// finalizer runs; they are restored with a zero share so the later
    /// release finds the claim.
    pub fn restore(&self, workloads: &[GpuWorkload], pods: &[Pod]) {
        let requests: BTreeMap<NameNamespace, ResourceAmount> = workloads
            .iter()
            .map(|w| {
                (
                    NameNamespace::new(w.name_any(), w.namespace().unwrap_or_default()),
                    w.spec.resources.requests.clone(),
                )
            })
            .collect();

        let mut devices = self.devices.lock();
        let mut restored = 0usize;
        for pod in pods {
            let Some(workload) = pod.labels().get(WORKLOAD_LABEL) else {
                continue;
            };
            let owner = NameNamespace::new(workload, pod.namespace().unwrap_or_default());
            let request = requests.get(&owner).cloned().unwrap_or_default();
            let tflops = request.tflops_value().unwrap_or_default();
            let vram = request.vram_mib().unwrap_or_default();
            let worker = pod.name_any();
            for name in gpu_names(pod) {
                match devices.get_mut(&name) {
                    Some(device) => {
                        device.claim(&owner, &worker, tflops, vram);
                        restored += 1;
                    }
                    None => warn!(gpu = %name, pod = %pod.name_any(), "Worker references unknown GPU"),
                }
            }
        }
        info!(claims = restored, "Restored GPU claims from worker pods");
    }

    /// Free tflops and vram (MiB) of a GPU, if known
    pub fn free_capacity(&self, gpu: &str) -> Option<(f64, u64)> {
        self.devices.lock().get(gpu).map(Device::free)
    }

    /// Number of workers the workload has on the named GPU
    pub fn workers_on(&self, workload: &NameNamespace, gpu: &str) -> usize {
        self.devices.lock().get(gpu).map_or(0, |d| {
            d.claims.keys().filter(|(owner, _)| owner == workload).count()
        })
    }
}

#[async_trait]
impl GpuAllocator for InventoryAllocator {
    async fn alloc(&self, request: &AllocRequest) -> Result<Vec<Gpu>> {
        if request.count == 0 {
            return Err(Error::allocation("gpu count must be at least 1"));
        }
        let tflops = request.request.tflops_value().map_err(Error::allocation)?;
        let vram = request.request.vram_mib().map_err(Error::allocation)?;

        let mut devices = self.devices.lock();

        let mut by_node: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, device) in devices.iter() {
            if !device.eligible(request) || !device.fits(tflops, vram) {
                continue;
            }
            if let Some(node) = device.gpu.node_name() {
                by_node.entry(node).or_default().push(name.clone());
            }
        }

        let Some(chosen) = by_node
            .into_values()
            .find(|names| names.len() >= request.count as usize)
        else {
            return Err(Error::allocation(format!(
                "no node in pool {} has {} free gpu(s) with {} tflops and {} MiB",
                request.pool_name, request.count, tflops, vram
            )));
        };

        let mut allocated = Vec::with_capacity(request.count as usize);
        for name in chosen.into_iter().take(request.count as usize) {
            if let Some(device) = devices.get_mut(&name) {
                device.claim(&request.workload, &request.worker, tflops, vram);
                allocated.push(device.gpu.clone());
            }
        }
        debug!(
            workload = %request.workload,
            worker = %request.worker,
            gpus = ?allocated.iter().map(|g| g.name_any()).collect::<Vec<_>>(),
            "Allocated GPUs"
        );
        Ok(allocated)
    }

    async fn dealloc(
        &self,
        workload: &NameNamespace,
        worker: &str,
        _request: &ResourceAmount,
        gpus: &[String],
    ) -> Result<()> {
        // the claim remembers its own share
        let mut devices = self.devices.lock();
        for name in gpus {
            let released = devices
                .get_mut(name)
                .is_some_and(|d| d.release(workload, worker));
            if !released {
                debug!(gpu = %name, workload = %workload, worker, "No claim to release");
            }
        }
        Ok(())
    }
}

/// GPU names recorded on a worker pod
pub fn gpu_names(pod: &Pod) -> Vec<String> {
    pod.annotations()
        .get(GPUS_ANNOTATION)
        .map(|value| parse_gpu_names(value))
        .unwrap_or_default()
}

/// Split a comma-separated GPU list, dropping blanks
pub fn parse_gpu_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
