//! Controller runner - builds the futures the operator binary drives
//!
//! Each `build_*` function returns a boxed future so `main` only composes
//! them. Construction does no I/O.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing::{debug, error, info, warn};

use crate::allocator::InventoryAllocator;
use crate::controller::{error_policy, reconcile, Context};
use crate::crd::GpuWorkload;
use crate::WORKLOAD_LABEL;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A long-running task owned by the operator
pub type OperatorTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the GpuWorkload controller
///
/// Worker pods are watched through their owner reference, so a pod change
/// reconciles the workload that owns it.
pub fn build_workload_controller(client: Client, ctx: Arc<Context>) -> OperatorTask {
    let workloads: Api<GpuWorkload> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    info!("- GpuWorkload controller");

    Box::pin(
        Controller::new(
            workloads,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(
            pods,
            WatcherConfig::default()
                .labels(WORKLOAD_LABEL)
                .timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("GpuWorkload")),
    )
}

/// Build the periodic GPU inventory refresh
///
/// Gpu objects come and go with nodes; the allocator's view is refreshed on
/// a fixed interval. Claims survive each refresh.
pub fn build_inventory_refresh(
    client: Client,
    allocator: Arc<InventoryAllocator>,
    interval: Duration,
) -> OperatorTask {
    info!(interval_secs = interval.as_secs(), "- GPU inventory refresh");

    Box::pin(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately and startup already synced
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match allocator.sync_from_cluster(&client).await {
                Ok(()) => debug!("GPU inventory refreshed"),
                Err(e) => warn!(error = %e, "Failed to refresh GPU inventory"),
            }
        }
    })
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
