//! Integration tests for the gpufleet operator
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how users interact with gpufleet.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating and reading GpuWorkload,
//!   GpuPool and Gpu resources through the Kubernetes API
//!
//! - `workload_lifecycle`: Stories about the reconciler driving a workload
//!   against a real API server: workers launched, rolled and drained
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod crd_operations;
mod helpers;
mod workload_lifecycle;
