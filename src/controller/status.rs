//! Workload status derived from observed worker pods
//!
//! Status is recomputed from scratch on every cycle and written only when it
//! differs from what is stored. Writing an unchanged status would bump the
//! resource version and wake the controller again, forever.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::cleanup::is_terminating;
use super::context::Context;
use crate::crd::{
    Condition, ConditionStatus, GpuWorkload, GpuWorkloadStatus, WorkerPhase, WorkerStatus,
    WorkloadPhase,
};
use crate::error::ResultExt;
use crate::events::{actions, reasons};
use crate::worker::WorkerGenerator;
use crate::Result;

/// Condition type reporting whether all workers are ready
pub const CONDITION_READY: &str = "Ready";

/// Snapshot of a workload's workers
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Observed {
    pub status: GpuWorkloadStatus,
    pub failed_workers: usize,
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Map a pod to its worker phase
pub(crate) fn worker_phase(pod: &Pod) -> WorkerPhase {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some("Running") if pod_is_ready(pod) => WorkerPhase::Running,
        Some("Failed") => WorkerPhase::Failed,
        _ => WorkerPhase::Pending,
    }
}

/// Derive status from the listed pods
///
/// Condition transition times are carried over from the stored status when
/// the condition status has not flipped.
pub(crate) fn observe(workload: &GpuWorkload, pods: &[Pod], hash: &str) -> Observed {
    let desired = workload.spec.desired_replicas();
    let mut ready = 0i32;
    let mut failed = 0usize;
    let mut workers = Vec::new();

    for pod in pods.iter().filter(|p| !is_terminating(p)) {
        let phase = worker_phase(pod);
        match phase {
            WorkerPhase::Running => ready += 1,
            WorkerPhase::Failed => failed += 1,
            WorkerPhase::Pending => {}
        }

        let port = match WorkerGenerator::worker_port(pod) {
            Ok(port) => port,
            Err(e) => {
                warn!(pod = %pod.name_any(), error = %e, "Cannot read worker port");
                continue;
            }
        };

        workers.push(WorkerStatus {
            worker_phase: phase,
            worker_name: pod.name_any(),
            worker_ip: pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
            worker_port: port,
            node_selector: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_selector.clone())
                .unwrap_or_default(),
            resource_version: pod.resource_version().unwrap_or_default(),
        });
    }

    let (phase, condition) = if ready == desired && failed == 0 {
        (
            WorkloadPhase::Running,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "WorkloadReady",
                "All workers are running",
            ),
        )
    } else if failed > 0 {
        (
            WorkloadPhase::Failed,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "WorkerFailed",
                format!("Failed workers: {failed}"),
            ),
        )
    } else {
        (
            WorkloadPhase::Pending,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                "WaitingForWorkers",
                format!("Ready replicas: {ready}/{desired}"),
            ),
        )
    };

    let previous = workload.status.clone().unwrap_or_default();
    Observed {
        status: GpuWorkloadStatus {
            replicas: pods.len() as i32,
            ready_replicas: ready,
            phase,
            conditions: vec![condition.carry_transition_time(&previous.conditions)],
            pod_template_hash: hash.to_string(),
            worker_statuses: workers,
        },
        failed_workers: failed,
    }
}

/// Write the derived status if anything in it changed
///
/// A conflict means the workload moved since it was read; the next cycle
/// recomputes from fresh state, so it is logged and turned into a requeue.
pub(crate) async fn update_status(
    ctx: &Context,
    workload: &GpuWorkload,
    pods: &[Pod],
    hash: &str,
) -> Result<Option<Action>> {
    let observed = observe(workload, pods, hash);
    let current = workload.status.clone().unwrap_or_default();
    if current == observed.status {
        return Ok(None);
    }

    if observed.failed_workers > 0 {
        ctx.events
            .publish(
                &workload.object_ref(&()),
                EventType::Warning,
                reasons::WORKER_FAILED,
                actions::RECONCILE,
                Some(format!("Failed workers: {}", observed.failed_workers)),
            )
            .await;
    }

    info!(
        phase = %observed.status.phase,
        ready_replicas = observed.status.ready_replicas,
        workers = observed.status.worker_statuses.len(),
        "Updating workload status"
    );
    match ctx
        .kube
        .patch_workload_status(workload, &observed.status)
        .await
    {
        Ok(_) => Ok(None),
        Err(e) if e.is_conflict() => {
            warn!(error = %e, "Workload changed during reconcile, retrying status update");
            Ok(Some(Action::requeue(ctx.pending_requeue)))
        }
        Err(e) => Err(e).context("update workload status"),
    }
}

/// Persist a new template hash before acting on it, returning the updated workload
pub(crate) async fn record_template_hash(
    ctx: &Context,
    workload: &GpuWorkload,
    hash: &str,
) -> Result<GpuWorkload> {
    let mut status = workload.status.clone().unwrap_or_default();
    status.pod_template_hash = hash.to_string();
    ctx.kube
        .patch_workload_status(workload, &status)
        .await
        .context("record pod template hash")
}
