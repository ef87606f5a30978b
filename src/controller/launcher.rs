//! Worker pod launch
//!
//! Launching is a reservation followed by a create. The caller names the pod
//! before allocating GPUs, so the GPU claim, the host port and the pod all
//! carry the same identity. When the create fails the port reservation is
//! handed back to the caller, which also owns the GPUs, so both can be
//! released before the next attempt.

use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::context::Context;
use crate::crd::{Gpu, GpuWorkload, NameNamespace};
use crate::worker::{WorkerGenerator, WorkerParams};
use crate::{Error, FINALIZER, GPUS_ANNOTATION, PORT_ANNOTATION, POD_TEMPLATE_HASH_LABEL, WORKLOAD_LABEL};

/// A host port held for a worker that may not exist
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PortReservation {
    pub node: String,
    pub port: u16,
    pub pod: NameNamespace,
}

/// Why a worker could not be started, and what it left reserved
#[derive(Debug)]
pub(crate) struct LaunchFailure {
    pub reservation: Option<PortReservation>,
    pub error: Error,
}

impl PortReservation {
    /// Force-release the port; the worker it was meant for does not exist
    pub(crate) async fn release(&self, ctx: &Context) {
        if let Err(e) = ctx
            .ports
            .release_host_port(&self.node, &self.pod, self.port, true)
            .await
        {
            warn!(node = %self.node, port = self.port, error = %e, "Failed to release host port");
        }
    }
}

impl LaunchFailure {
    fn new(reservation: Option<PortReservation>, error: Error) -> Self {
        Self { reservation, error }
    }
}

/// Start worker pod `name` bound to `gpus`
pub(crate) async fn try_start_worker(
    ctx: &Context,
    generator: &WorkerGenerator,
    gpus: &[Gpu],
    workload: &GpuWorkload,
    name: &str,
    hash: &str,
) -> Result<Pod, LaunchFailure> {
    let Some(node) = gpus.first().and_then(Gpu::node_name) else {
        return Err(LaunchFailure::new(
            None,
            Error::validation("no gpus or no node label, cannot assign host port for worker"),
        ));
    };

    let workload_name = workload.name_any();
    let namespace = workload.namespace().unwrap_or_default();
    let owner = NameNamespace::new(name, namespace.clone());

    let port = ctx
        .ports
        .assign_host_port(&node, &owner)
        .await
        .map_err(|e| LaunchFailure::new(None, e.context("reserve host port")))?;
    let reservation = PortReservation {
        node,
        port,
        pod: owner,
    };
    let fail = |error: Error| LaunchFailure::new(Some(reservation.clone()), error);

    let mut pod = generator
        .generate_worker_pod(&WorkerParams {
            gpus,
            workload: &workload_name,
            name,
            namespace: &namespace,
            port,
            requests: &workload.spec.resources.requests,
            limits: &workload.spec.resources.limits,
            hash,
        })
        .map_err(|e| fail(e.context("generate worker pod")))?;

    let gpu_names = gpus.iter().map(|g| g.name_any()).collect::<Vec<_>>().join(",");
    let labels = pod.labels_mut();
    labels.insert(WORKLOAD_LABEL.to_string(), workload_name.clone());
    labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
    let annotations = pod.annotations_mut();
    annotations.insert(GPUS_ANNOTATION.to_string(), gpu_names);
    annotations.insert(PORT_ANNOTATION.to_string(), port.to_string());
    pod.finalizers_mut().push(FINALIZER.to_string());

    let owner_ref = workload
        .controller_owner_ref(&())
        .ok_or_else(|| fail(Error::validation("workload has no uid, cannot own worker pods")))?;
    pod.owner_references_mut().push(owner_ref);

    let created = ctx
        .kube
        .create_pod(&pod)
        .await
        .map_err(|e| fail(e.context("create pod")))?;

    info!(pod = %name, port, gpus = %gpus.len(), "Started worker");
    Ok(created)
}
