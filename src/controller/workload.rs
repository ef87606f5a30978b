//! GpuWorkload reconciliation
//!
//! Every cycle starts from a fresh read of the workload and its worker pods and
//! walks the same sequence: finalizers, cleanup of terminating workers,
//! template rollout, scaling, then status. A step that needs the cluster to
//! settle ends the cycle with an [`Action`]; later steps run on a later cycle.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::cleanup::{self, is_terminating};
use super::context::Context;
use super::{scaler, status};
use crate::crd::GpuWorkload;
use crate::error::ResultExt;
use crate::worker::WorkerGenerator;
use crate::{Error, FINALIZER, POD_TEMPLATE_HASH_LABEL};

fn workload_key(workload: &GpuWorkload) -> String {
    format!(
        "{}/{}",
        workload.namespace().unwrap_or_default(),
        workload.name_any()
    )
}

/// Reconcile a GpuWorkload
///
/// The object handed in by the runtime may be stale; only its key is used.
#[instrument(skip(workload, ctx), fields(workload = %workload.name_any(), namespace = %workload.namespace().unwrap_or_default()))]
pub async fn reconcile(workload: Arc<GpuWorkload>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = workload.name_any();
    let Some(namespace) = workload.namespace() else {
        return Err(Error::validation("GpuWorkload has no namespace"));
    };
    debug!("reconciling workload");

    let action = reconcile_key(&name, &namespace, &ctx).await?;
    ctx.reset_failures(&workload_key(&workload));
    Ok(action)
}

/// Error policy for the workload controller
///
/// Backs off per workload: consecutive failures double the delay up to the
/// configured cap.
pub fn error_policy(workload: Arc<GpuWorkload>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = workload_key(&workload);
    let failures = ctx.record_failure(&key);
    let delay = ctx.error_backoff.jittered_delay_for_attempt(failures);
    error!(
        ?error,
        workload = %key,
        failures,
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn reconcile_key(name: &str, namespace: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(mut workload) = ctx
        .kube
        .get_workload(name, namespace)
        .await
        .context("get workload")?
    else {
        debug!("workload no longer exists");
        ctx.metrics.retain_workers(namespace, name, &[]);
        return Ok(Action::await_change());
    };

    let pods = ctx
        .kube
        .list_worker_pods(name, namespace)
        .await
        .context("list worker pods")?;
    ctx.metrics.retain_workers(namespace, name, &pods);

    let deleting = workload.metadata.deletion_timestamp.is_some();
    if deleting {
        if let Some(action) = handle_deletion(ctx, &workload, &pods).await? {
            return Ok(action);
        }
    } else if !workload.finalizers().iter().any(|f| f == FINALIZER) {
        ctx.kube
            .add_workload_finalizer(name, namespace)
            .await
            .context("add workload finalizer")?;
        // continue with the new resource version so status writes are not rejected
        match ctx.kube.get_workload(name, namespace).await.context("get workload")? {
            Some(updated) => workload = updated,
            None => return Ok(Action::await_change()),
        }
    }

    if let Some(action) = cleanup::process_worker_pods(ctx, &workload, &pods).await? {
        return Ok(action);
    }
    if deleting {
        return Ok(Action::await_change());
    }

    workload.spec.validate()?;

    let now = Utc::now();
    for pod in &pods {
        ctx.metrics.set_worker_metrics(pod, &workload, now);
    }

    let pool_name = workload.spec.pool_name.clone();
    let pool = ctx
        .kube
        .get_pool(&pool_name)
        .await
        .context("get gpu pool")?
        .ok_or(Error::PoolNotFound(pool_name))?;
    let generator = WorkerGenerator::for_pool(&pool).context("load worker template")?;
    let hash = generator
        .pod_template_hash(&workload.spec)
        .context("compute pod template hash")?;

    let recorded = workload
        .status
        .as_ref()
        .map(|s| s.pod_template_hash.as_str());
    if recorded != Some(hash.as_str()) {
        info!(from = ?recorded, to = %hash, "Pod template changed");
        workload = match status::record_template_hash(ctx, &workload, &hash).await {
            Ok(updated) => updated,
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Workload changed during reconcile, retrying");
                return Ok(Action::requeue(ctx.pending_requeue));
            }
            Err(e) => return Err(e),
        };
    }

    let (current, outdated): (Vec<Pod>, Vec<Pod>) = pods
        .into_iter()
        .partition(|p| p.labels().get(POD_TEMPLATE_HASH_LABEL) == Some(&hash));
    if !outdated.is_empty() {
        info!(outdated = outdated.len(), "Replacing workers rendered from an old template");
        scaler::scale_down(ctx, &workload, &outdated)
            .await
            .context("delete outdated workers")?;
        return Ok(scaler::roll_requeue());
    }

    if let Some(action) =
        scaler::reconcile_scale(ctx, &workload, &generator, &hash, &current).await?
    {
        return Ok(action);
    }

    Ok(status::update_status(ctx, &workload, &current, &hash)
        .await?
        .unwrap_or_else(Action::await_change))
}

/// Hold the workload until every worker is gone
///
/// Live workers are deleted in bulk; the workload finalizer comes off only
/// once no worker pod is left. Terminating workers fall through to cleanup.
async fn handle_deletion(
    ctx: &Context,
    workload: &GpuWorkload,
    pods: &[Pod],
) -> Result<Option<Action>, Error> {
    let name = workload.name_any();
    let namespace = workload.namespace().unwrap_or_default();

    let live = pods.iter().filter(|p| !is_terminating(p)).count();
    if live > 0 {
        info!(live, "Workload is being deleted, deleting its workers");
        ctx.kube
            .delete_worker_pods(&name, &namespace)
            .await
            .context("delete worker pods")?;
        return Ok(Some(Action::await_change()));
    }

    if pods.is_empty() {
        ctx.kube
            .remove_workload_finalizer(&name, &namespace)
            .await
            .context("remove workload finalizer")?;
        info!("All workers released, removed workload finalizer");
        return Ok(Some(Action::await_change()));
    }

    Ok(None)
}
