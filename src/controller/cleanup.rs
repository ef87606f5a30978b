//! GPU release for terminating worker pods
//!
//! A worker pod keeps the cleanup finalizer until its GPUs are back with the
//! allocator. Release is fenced by a compare-and-swap write on the pod: the
//! `gpu-released` annotation is stamped with a fresh token through a replace
//! carrying the observed resource version. Only the reconcile that wins that
//! write calls the allocator, so a stale cache replaying the same terminating
//! pod cannot release its GPUs twice. A pod that already carries the
//! annotation was released by an earlier cycle whose finalizer removal did
//! not land; only the finalizer is left to remove.

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::context::Context;
use crate::allocator::gpu_names;
use crate::crd::{GpuWorkload, NameNamespace};
use crate::error::ResultExt;
use crate::ports::{annotated_port, pod_node};
use crate::{Result, FINALIZER, GPUS_ANNOTATION, GPU_RELEASED_ANNOTATION};

pub(crate) fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub(crate) fn has_finalizer(pod: &Pod) -> bool {
    pod.finalizers().iter().any(|f| f == FINALIZER)
}

fn pod_key(pod: &Pod) -> NameNamespace {
    NameNamespace::new(pod.name_any(), pod.namespace().unwrap_or_default())
}

/// Release GPUs of terminating workers and keep finalizers on live ones
///
/// Returns a requeue when any worker is terminating: scaling waits until
/// deletions have been observed to finish.
pub(crate) async fn process_worker_pods(
    ctx: &Context,
    workload: &GpuWorkload,
    pods: &[Pod],
) -> Result<Option<Action>> {
    let mut any_terminating = false;

    for pod in pods {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();

        if let Some(deleted_at) = &pod.metadata.deletion_timestamp {
            any_terminating = true;
            ctx.metrics.remove_worker_metrics(pod, deleted_at.0);
            release_host_port(ctx, pod, false).await;

            if has_finalizer(pod) {
                release_pod_gpus(ctx, workload, pod)
                    .await
                    .context(&format!("release gpus of pod {name}"))?;
                ctx.kube
                    .remove_pod_finalizer(&name, &namespace)
                    .await
                    .context(&format!("remove finalizer of pod {name}"))?;
                info!(pod = %name, "Released worker GPUs and removed finalizer");
            }
        } else if !has_finalizer(pod) {
            debug!(pod = %name, "Restoring cleanup finalizer on worker");
            ctx.kube
                .add_pod_finalizer(&name, &namespace)
                .await
                .context(&format!("add finalizer to pod {name}"))?;
        }
    }

    Ok(any_terminating.then(|| Action::requeue(ctx.pending_requeue)))
}

/// Fence and release the GPUs held by one terminating worker
///
/// A conflict or not-found on the fence write aborts before the allocator is
/// touched. An allocator failure leaves the finalizer for the next cycle.
pub(crate) async fn release_pod_gpus(
    ctx: &Context,
    workload: &GpuWorkload,
    pod: &Pod,
) -> Result<()> {
    if pod.annotations().contains_key(GPU_RELEASED_ANNOTATION) {
        debug!(pod = %pod.name_any(), "Worker GPUs already released");
        return Ok(());
    }

    let mut marked = pod.clone();
    marked
        .annotations_mut()
        .insert(GPU_RELEASED_ANNOTATION.to_string(), release_token());
    ctx.kube
        .replace_pod(&marked)
        .await
        .context("mark gpu release")?;

    if !pod.annotations().contains_key(GPUS_ANNOTATION) {
        info!(pod = %pod.name_any(), "Worker has cleanup finalizer but no GPU annotation");
        return Ok(());
    }

    let gpus = gpu_names(pod);
    let owner = NameNamespace::new(workload.name_any(), workload.namespace().unwrap_or_default());
    ctx.allocator
        .dealloc(&owner, &pod.name_any(), &workload.spec.resources.requests, &gpus)
        .await
        .context("deallocate gpus")?;
    info!(pod = %pod.name_any(), gpus = ?gpus, "Released GPU resources");
    Ok(())
}

/// Best-effort host port release; failures are expected once a port is recycled
pub(crate) async fn release_host_port(ctx: &Context, pod: &Pod, force: bool) {
    let (Some(node), Some(port)) = (pod_node(pod), annotated_port(pod)) else {
        debug!(pod = %pod.name_any(), "Worker has no node or port to release");
        return;
    };
    if let Err(e) = ctx.ports.release_host_port(&node, &pod_key(pod), port, force).await {
        debug!(pod = %pod.name_any(), node = %node, port, error = %e, "Host port not released");
    }
}

fn release_token() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp(), &id[..12])
}
