//! GpuWorkload controller
//!
//! The reconciler turns a GpuWorkload into GPU-bound worker pods. It is split
//! by concern:
//!
//! - `workload` - the reconcile entry point and step ordering
//! - `cleanup` - fenced GPU release for terminating workers
//! - `scaler` - replica scaling and outdated-worker removal
//! - `launcher` - starting one worker on allocated GPUs
//! - `status` - status derived from observed workers
//! - `client` / `context` - the cluster seam and shared state

mod cleanup;
mod client;
mod context;
#[cfg(test)]
mod fake;
mod launcher;
mod scaler;
mod status;
mod workload;

pub use client::{KubeClient, KubeClientImpl};
pub use context::{Context, ContextBuilder};
pub use status::CONDITION_READY;
pub use workload::{error_policy, reconcile};
