//! Metrics registry for gpufleet observability
//!
//! Provides OpenTelemetry metrics for:
//! - GPU scheduling attempts (by pool and result)
//! - Worker resource requests (tflops and vram per worker)
//! - Worker lifetime (recorded when a worker is observed terminating)
//!
//! The reconciler talks to these through the [`WorkerMetrics`] trait so tests
//! can observe calls without an exporter.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
#[cfg(test)]
use mockall::automock;
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::GpuWorkload;

/// Global meter for gpufleet metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("gpufleet"));

// ============================================================================
// Scheduling Metrics
// ============================================================================

/// Counter of GPU allocation attempts
///
/// Labels:
/// - `pool`: GpuPool name
/// - `result`: success, failure
pub static SCHEDULING_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("gpufleet_scheduling_attempts_total")
        .with_description("Total number of GPU allocation attempts by pool and result")
        .with_unit("{attempts}")
        .build()
});

// ============================================================================
// Worker Metrics
// ============================================================================

/// Gauge of TFLOPS requested by each worker
///
/// Labels:
/// - `namespace`, `workload`, `worker`, `pool`
pub static WORKER_REQUESTED_TFLOPS: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("gpufleet_worker_requested_tflops")
        .with_description("TFLOPS requested by a worker")
        .with_unit("TFLOPS")
        .build()
});

/// Gauge of GPU memory requested by each worker
///
/// Labels:
/// - `namespace`, `workload`, `worker`, `pool`
pub static WORKER_REQUESTED_VRAM: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("gpufleet_worker_requested_vram_mebibytes")
        .with_description("GPU memory requested by a worker")
        .with_unit("MiBy")
        .build()
});

/// Histogram of worker lifetime from first observation to deletion
///
/// Labels:
/// - `namespace`, `workload`, `pool`
pub static WORKER_LIFETIME: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("gpufleet_worker_lifetime_seconds")
        .with_description("Lifetime of worker pods in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Recording
// ============================================================================

/// Sink for the metrics the reconciler reports
#[cfg_attr(test, automock)]
pub trait WorkerMetrics: Send + Sync {
    /// Record the outcome of one GPU allocation attempt for a pool
    fn set_scheduler_metrics(&self, pool: &str, success: bool);

    /// Record the current requests of a live worker
    fn set_worker_metrics(&self, pod: &Pod, workload: &GpuWorkload, now: DateTime<Utc>);

    /// Forget a worker that is going away. Idempotent.
    fn remove_worker_metrics(&self, pod: &Pod, deletion_time: DateTime<Utc>);

    /// Forget tracked workers of the workload that are no longer listed
    fn retain_workers(&self, namespace: &str, workload: &str, pods: &[Pod]);
}

#[derive(Clone, Debug)]
struct TrackedWorker {
    namespace: String,
    workload: String,
    pool: String,
    first_seen: DateTime<Utc>,
}

/// [`WorkerMetrics`] backed by the global OpenTelemetry meter
#[derive(Default)]
pub struct OtelWorkerMetrics {
    workers: DashMap<String, TrackedWorker>,
}

impl OtelWorkerMetrics {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers currently tracked
    pub fn tracked_workers(&self) -> usize {
        self.workers.len()
    }

    fn key(pod: &Pod) -> String {
        format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
    }
}

impl WorkerMetrics for OtelWorkerMetrics {
    fn set_scheduler_metrics(&self, pool: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        SCHEDULING_ATTEMPTS.add(
            1,
            &[
                KeyValue::new("pool", pool.to_string()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn set_worker_metrics(&self, pod: &Pod, workload: &GpuWorkload, now: DateTime<Utc>) {
        let requests = &workload.spec.resources.requests;
        let labels = [
            KeyValue::new("namespace", pod.namespace().unwrap_or_default()),
            KeyValue::new("workload", workload.name_any()),
            KeyValue::new("worker", pod.name_any()),
            KeyValue::new("pool", workload.spec.pool_name.clone()),
        ];
        WORKER_REQUESTED_TFLOPS.record(requests.tflops_value().unwrap_or_default(), &labels);
        WORKER_REQUESTED_VRAM.record(requests.vram_mib().unwrap_or_default(), &labels);

        self.workers
            .entry(Self::key(pod))
            .or_insert_with(|| TrackedWorker {
                namespace: pod.namespace().unwrap_or_default(),
                workload: workload.name_any(),
                pool: workload.spec.pool_name.clone(),
                first_seen: now,
            });
    }

    fn remove_worker_metrics(&self, pod: &Pod, deletion_time: DateTime<Utc>) {
        let Some((_, worker)) = self.workers.remove(&Self::key(pod)) else {
            return;
        };
        let lifetime = (deletion_time - worker.first_seen)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        WORKER_LIFETIME.record(
            lifetime,
            &[
                KeyValue::new("namespace", worker.namespace.clone()),
                KeyValue::new("workload", worker.workload.clone()),
                KeyValue::new("pool", worker.pool.clone()),
            ],
        );
        clear_requests(&worker, &pod.name_any());
    }

    fn retain_workers(&self, namespace: &str, workload: &str, pods: &[Pod]) {
        let listed: HashSet<String> = pods.iter().map(Self::key).collect();
        let gone: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| {
                let worker = entry.value();
                worker.namespace == namespace
                    && worker.workload == workload
                    && !listed.contains(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in gone {
            if let Some((key, worker)) = self.workers.remove(&key) {
                let name = key.rsplit('/').next().unwrap_or_default();
                debug!(worker = %key, "Worker vanished without terminating, untracking");
                clear_requests(&worker, name);
            }
        }
    }
}

fn clear_requests(worker: &TrackedWorker, name: &str) {
    let labels = [
        KeyValue::new("namespace", worker.namespace.clone()),
        KeyValue::new("workload", worker.workload.clone()),
        KeyValue::new("worker", name.to_string()),
        KeyValue::new("pool", worker.pool.clone()),
    ];
    WORKER_REQUESTED_TFLOPS.record(0.0, &labels);
    WORKER_REQUESTED_VRAM.record(0, &labels);
}
