//! In-memory cluster for driving whole reconcile cycles in tests
//!
//! Models the API server behaviors the reconciler depends on: resource
//! versions with compare-and-swap on replace and status writes, deletion
//! blocked by finalizers, and label-selected collection deletes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use parking_lot::Mutex;

use super::client::KubeClient;
use super::context::Context;
use crate::allocator::{AllocRequest, GpuAllocator, InventoryAllocator};
use crate::crd::{Gpu, GpuPool, GpuWorkload, GpuWorkloadStatus, NameNamespace, ResourceAmount};
use crate::error::api_error;
use crate::events::EventPublisher;
use crate::metrics::OtelWorkerMetrics;
use crate::ports::HostPortAllocator;
use crate::{Error, FINALIZER, WORKLOAD_LABEL};

type Key = (String, String);

fn key(name: &str, namespace: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    revision: u64,
    clock: i64,
    workloads: BTreeMap<Key, GpuWorkload>,
    pools: BTreeMap<String, GpuPool>,
    pods: BTreeMap<Key, Pod>,
    created: Vec<Pod>,
    status_writes: usize,
    fail_creates: bool,
    failing_finalizer_removals: u32,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn tick(&mut self) -> Time {
        self.clock += 10;
        Time(
            Utc.timestamp_opt(1_700_000_000 + self.clock, 0)
                .single()
                .unwrap_or_default(),
        )
    }

    /// Delete a pod the way the API server does: mark it while finalizers remain
    fn delete_pod(&mut self, k: &Key) {
        let now = self.tick();
        let revision = self.next_revision();
        let Some(pod) = self.pods.get_mut(k) else {
            return;
        };
        if pod.finalizers().is_empty() {
            self.pods.remove(k);
        } else if pod.metadata.deletion_timestamp.is_none() {
            pod.metadata.deletion_timestamp = Some(now);
            pod.metadata.resource_version = Some(revision);
        }
    }

    fn not_found() -> Error {
        api_error(404, "NotFound")
    }

    fn conflict() -> Error {
        api_error(409, "Conflict")
    }
}

fn without_finalizer(meta: &mut ObjectMeta) -> bool {
    let before = meta.finalizers.as_ref().map_or(0, Vec::len);
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != FINALIZER);
    }
    before != meta.finalizers.as_ref().map_or(0, Vec::len)
}

fn with_finalizer(meta: &mut ObjectMeta) -> bool {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == FINALIZER) {
        return false;
    }
    finalizers.push(FINALIZER.to_string());
    true
}

/// Fake API server backing [`KubeClient`]
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pool(&self, pool: GpuPool) {
        self.state.lock().pools.insert(pool.name_any(), pool);
    }

    pub fn insert_workload(&self, mut workload: GpuWorkload) {
        let mut state = self.state.lock();
        let k = key(&workload.name_any(), &workload.namespace().unwrap_or_default());
        workload.metadata.uid = Some(format!("uid-{}", k.1));
        workload.metadata.resource_version = Some(state.next_revision());
        state.workloads.insert(k, workload);
    }

    pub fn workload(&self, name: &str, namespace: &str) -> Option<GpuWorkload> {
        self.state.lock().workloads.get(&key(name, namespace)).cloned()
    }

    pub fn update_workload(&self, name: &str, namespace: &str, f: impl FnOnce(&mut GpuWorkload)) {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        if let Some(w) = state.workloads.get_mut(&key(name, namespace)) {
            f(w);
            w.metadata.resource_version = Some(revision);
        }
    }

    pub fn pool(&self, name: &str) -> Option<GpuPool> {
        self.state.lock().pools.get(name).cloned()
    }

    /// Latest resource version handed out; unchanged means nothing was written
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    pub fn update_pool(&self, name: &str, f: impl FnOnce(&mut GpuPool)) {
        if let Some(pool) = self.state.lock().pools.get_mut(name) {
            f(pool);
        }
    }

    /// Delete a workload; it lingers with a deletion timestamp while finalizers remain
    pub fn delete_workload(&self, name: &str, namespace: &str) {
        let mut state = self.state.lock();
        let now = state.tick();
        let revision = state.next_revision();
        let k = key(name, namespace);
        let Some(w) = state.workloads.get_mut(&k) else {
            return;
        };
        if w.finalizers().is_empty() {
            state.workloads.remove(&k);
        } else {
            w.metadata.deletion_timestamp = Some(now);
            w.metadata.resource_version = Some(revision);
        }
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.state.lock().pods.values().cloned().collect()
    }

    pub fn live_pods(&self) -> Vec<Pod> {
        self.pods()
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .collect()
    }

    /// Every pod the reconciler ever created, as submitted
    pub fn created(&self) -> Vec<Pod> {
        self.state.lock().created.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().status_writes
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    /// Make the next `n` pod finalizer removals fail with a server error
    pub fn fail_finalizer_removals(&self, n: u32) {
        self.state.lock().failing_finalizer_removals = n;
    }

    /// Play the kubelet: every live pod becomes Running and Ready
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        let keys: Vec<Key> = state
            .pods
            .iter()
            .filter(|(_, p)| p.metadata.deletion_timestamp.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        for (n, k) in keys.into_iter().enumerate() {
            let revision = state.next_revision();
            if let Some(pod) = state.pods.get_mut(&k) {
                pod.status = Some(PodStatus {
                    phase: Some("Running".to_string()),
                    pod_ip: Some(format!("10.0.0.{}", n + 10)),
                    conditions: Some(vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
                pod.metadata.resource_version = Some(revision);
            }
        }
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_workload(&self, name: &str, namespace: &str) -> Result<Option<GpuWorkload>, Error> {
        Ok(self.workload(name, namespace))
    }

    async fn list_worker_pods(&self, workload: &str, namespace: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), p)| {
                ns == namespace && p.labels().get(WORKLOAD_LABEL).map(String::as_str) == Some(workload)
            })
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn add_workload_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        let w = state
            .workloads
            .get_mut(&key(name, namespace))
            .ok_or_else(State::not_found)?;
        if with_finalizer(&mut w.metadata) {
            w.metadata.resource_version = Some(revision);
        }
        Ok(())
    }

    async fn remove_workload_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        let k = key(name, namespace);
        let Some(w) = state.workloads.get_mut(&k) else {
            return Ok(());
        };
        if without_finalizer(&mut w.metadata) {
            w.metadata.resource_version = Some(revision);
            if w.metadata.deletion_timestamp.is_some() && w.finalizers().is_empty() {
                state.workloads.remove(&k);
            }
        }
        Ok(())
    }

    async fn delete_worker_pods(&self, workload: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let keys: Vec<Key> = state
            .pods
            .iter()
            .filter(|((ns, _), p)| {
                ns == namespace && p.labels().get(WORKLOAD_LABEL).map(String::as_str) == Some(workload)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            state.delete_pod(&k);
        }
        Ok(())
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error> {
        self.state.lock().delete_pod(&key(name, namespace));
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let mut state = self.state.lock();
        if state.fail_creates {
            return Err(api_error(500, "InternalError"));
        }
        let k = key(&pod.name_any(), &pod.namespace().unwrap_or_default());
        if state.pods.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.created.push(pod.clone());

        let mut stored = pod.clone();
        stored.metadata.creation_timestamp = Some(state.tick());
        stored.metadata.resource_version = Some(state.next_revision());
        stored.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.pods.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        let k = key(&pod.name_any(), &pod.namespace().unwrap_or_default());
        let current = state.pods.get_mut(&k).ok_or_else(State::not_found)?;
        if current.metadata.resource_version != pod.metadata.resource_version {
            return Err(State::conflict());
        }
        let deletion = current.metadata.deletion_timestamp.clone();
        *current = pod.clone();
        current.metadata.deletion_timestamp = deletion;
        current.metadata.resource_version = Some(revision);
        Ok(current.clone())
    }

    async fn add_pod_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        let pod = state
            .pods
            .get_mut(&key(name, namespace))
            .ok_or_else(State::not_found)?;
        if with_finalizer(&mut pod.metadata) {
            pod.metadata.resource_version = Some(revision);
        }
        Ok(())
    }

    async fn remove_pod_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.failing_finalizer_removals > 0 {
            state.failing_finalizer_removals -= 1;
            return Err(api_error(500, "InternalError"));
        }
        let revision = state.next_revision();
        let k = key(name, namespace);
        let Some(pod) = state.pods.get_mut(&k) else {
            return Ok(());
        };
        if without_finalizer(&mut pod.metadata) {
            pod.metadata.resource_version = Some(revision);
            if pod.metadata.deletion_timestamp.is_some() && pod.finalizers().is_empty() {
                state.pods.remove(&k);
            }
        }
        Ok(())
    }

    async fn get_pool(&self, name: &str) -> Result<Option<GpuPool>, Error> {
        Ok(self.pool(name))
    }

    async fn patch_workload_status(
        &self,
        workload: &GpuWorkload,
        status: &GpuWorkloadStatus,
    ) -> Result<GpuWorkload, Error> {
        let mut state = self.state.lock();
        let revision = state.next_revision();
        let k = key(&workload.name_any(), &workload.namespace().unwrap_or_default());
        let current = state.workloads.get_mut(&k).ok_or_else(State::not_found)?;
        if current.metadata.resource_version != workload.metadata.resource_version {
            return Err(State::conflict());
        }
        current.status = Some(status.clone());
        current.metadata.resource_version = Some(revision);
        let updated = current.clone();
        state.status_writes += 1;
        Ok(updated)
    }
}

/// Allocator that records every release before delegating to the inventory
#[derive(Default)]
pub(crate) struct CountingAllocator {
    pub inner: InventoryAllocator,
    deallocs: Mutex<Vec<(NameNamespace, String, Vec<String>)>>,
}

impl CountingAllocator {
    pub fn with_gpus(gpus: Vec<Gpu>) -> Self {
        let allocator = Self::default();
        allocator.inner.sync(gpus);
        allocator
    }

    pub fn deallocs(&self) -> Vec<(NameNamespace, Vec<String>)> {
        self.deallocs
            .lock()
            .iter()
            .map(|(owner, _, gpus)| (owner.clone(), gpus.clone()))
            .collect()
    }

    /// How many times the named GPU was released
    pub fn releases_of(&self, gpu: &str) -> usize {
        self.deallocs
            .lock()
            .iter()
            .filter(|(_, _, gpus)| gpus.iter().any(|g| g == gpu))
            .count()
    }

    /// How many times the named worker pod's GPUs were released
    pub fn releases_for(&self, worker: &str) -> usize {
        self.deallocs
            .lock()
            .iter()
            .filter(|(_, w, _)| w == worker)
            .count()
    }
}

#[async_trait]
impl GpuAllocator for CountingAllocator {
    async fn alloc(&self, request: &AllocRequest) -> crate::Result<Vec<Gpu>> {
        self.inner.alloc(request).await
    }

    async fn dealloc(
        &self,
        workload: &NameNamespace,
        worker: &str,
        request: &ResourceAmount,
        gpus: &[String],
    ) -> crate::Result<()> {
        self.deallocs
            .lock()
            .push((workload.clone(), worker.to_string(), gpus.to_vec()));
        self.inner.dealloc(workload, worker, request, gpus).await
    }
}

/// Event sink that keeps what was published
#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<(EventType, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self, type_: EventType) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| *t == type_)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &k8s_openapi::api::core::v1::ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events.lock().push((type_, reason.to_string()));
    }
}

/// A fake cluster with its collaborators, wired into a reconcile context
pub(crate) struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub allocator: Arc<CountingAllocator>,
    pub ports: Arc<HostPortAllocator>,
    pub events: Arc<RecordingEvents>,
    pub metrics: Arc<OtelWorkerMetrics>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(gpus: Vec<Gpu>) -> Self {
        let cluster = Arc::new(FakeCluster::new());
        let allocator = Arc::new(CountingAllocator::with_gpus(gpus));
        let ports = Arc::new(HostPortAllocator::new(42000, 42100));
        let events = Arc::new(RecordingEvents::default());
        let metrics = Arc::new(OtelWorkerMetrics::new());
        let ctx = Arc::new(Context::for_testing(
            cluster.clone(),
            allocator.clone(),
            ports.clone(),
            events.clone(),
            metrics.clone(),
        ));
        Self {
            cluster,
            allocator,
            ports,
            events,
            metrics,
            ctx,
        }
    }
}
