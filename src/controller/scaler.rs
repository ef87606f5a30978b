//! Replica scaling for a workload's current-hash workers

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::context::Context;
use super::launcher::try_start_worker;
use crate::allocator::AllocRequest;
use crate::crd::GpuWorkload;
use crate::error::ResultExt;
use crate::events::{actions, reasons};
use crate::worker::{worker_name, WorkerGenerator};
use crate::Result;

/// Move the number of workers toward the desired replica count
///
/// Returns a requeue when allocation could not be satisfied; the remaining
/// workers are started on a later cycle rather than retried here.
pub(crate) async fn reconcile_scale(
    ctx: &Context,
    workload: &GpuWorkload,
    generator: &WorkerGenerator,
    hash: &str,
    pods: &[Pod],
) -> Result<Option<Action>> {
    let desired = usize::try_from(workload.spec.desired_replicas()).unwrap_or(0);
    let current = pods.len();

    if current < desired {
        info!(from = current, to = desired, "Scaling up workers");
        scale_up(ctx, workload, generator, hash, desired - current)
            .await
            .context("scale up workers")
    } else if current > desired {
        info!(from = current, to = desired, "Scaling down workers");
        let excess = oldest_first(pods)
            .into_iter()
            .take(current - desired)
            .collect::<Vec<_>>();
        scale_down(ctx, workload, &excess).await?;
        Ok(None)
    } else {
        Ok(None)
    }
}

async fn scale_up(
    ctx: &Context,
    workload: &GpuWorkload,
    generator: &WorkerGenerator,
    hash: &str,
    count: usize,
) -> Result<Option<Action>> {
    let workload_name = workload.name_any();

    for _ in 0..count {
        // named up front so the GPU claim belongs to this pod
        let name = worker_name(&workload_name);
        let request = AllocRequest::for_worker(workload, &name);
        let gpus = match ctx.allocator.alloc(&request).await {
            Ok(gpus) => gpus,
            Err(e) => {
                warn!(pool = %request.pool_name, error = %e, "Failed to schedule GPU");
                ctx.metrics.set_scheduler_metrics(&request.pool_name, false);
                ctx.events
                    .publish(
                        &workload.object_ref(&()),
                        EventType::Warning,
                        reasons::SCHEDULE_GPU_FAILED,
                        actions::SCALE,
                        Some(format!("Failed to schedule GPU: {e}")),
                    )
                    .await;
                return Ok(Some(Action::requeue(ctx.pending_requeue)));
            }
        };
        ctx.metrics.set_scheduler_metrics(&request.pool_name, true);

        if let Err(failure) = try_start_worker(ctx, generator, &gpus, workload, &name, hash).await {
            if let Some(reservation) = &failure.reservation {
                reservation.release(ctx).await;
            }
            let names = gpus.iter().map(|g| g.name_any()).collect::<Vec<_>>();
            if let Err(e) = ctx
                .allocator
                .dealloc(&request.workload, &request.worker, &request.request, &names)
                .await
            {
                warn!(gpus = ?names, error = %e, "Failed to release GPUs of unstarted worker");
            }
            return Err(failure.error).context("create worker pod");
        }
    }

    ctx.events
        .publish(
            &workload.object_ref(&()),
            EventType::Normal,
            reasons::WORKER_SCALING,
            actions::SCALE,
            Some(format!("Started {count} worker(s)")),
        )
        .await;
    Ok(None)
}

/// Delete workers; their cleanup finalizers release GPUs once deletion is observed
pub(crate) async fn scale_down(ctx: &Context, workload: &GpuWorkload, pods: &[Pod]) -> Result<()> {
    for pod in pods {
        let name = pod.name_any();
        info!(pod = %name, workload = %workload.name_any(), "Scaling down worker pod");
        ctx.kube
            .delete_pod(&name, &pod.namespace().unwrap_or_default())
            .await
            .context("delete worker pod")?;
    }
    Ok(())
}

/// Sort by creation time, oldest first, breaking ties by name
pub(crate) fn oldest_first(pods: &[Pod]) -> Vec<Pod> {
    let mut sorted = pods.to_vec();
    sorted.sort_by(|a, b| {
        let created = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
        created(a)
            .cmp(&created(b))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    sorted
}

/// Requeue immediately after deleting outdated workers so replacements follow
pub(crate) fn roll_requeue() -> Action {
    Action::requeue(Duration::ZERO)
}
