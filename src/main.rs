//! gpufleet operator - reconciles GpuWorkloads into GPU-bound worker pods

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use gpufleet::allocator::InventoryAllocator;
use gpufleet::config::OperatorConfig;
use gpufleet::controller::Context;
use gpufleet::crd::{Gpu, GpuPool, GpuWorkload};
use gpufleet::ports::HostPortAllocator;
use gpufleet::retry::{retry_with_backoff, RetryConfig};
use gpufleet::telemetry::init_telemetry;
use gpufleet::{runner, CONTROLLER_NAME, WORKLOAD_LABEL};

/// gpufleet - Kubernetes operator for GPU workloads
#[derive(Parser, Debug)]
#[command(name = "gpufleet", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the gpufleet CRDs, rebuilds GPU and host port reservations
    /// from existing worker pods, then reconciles GpuWorkloads until
    /// SIGTERM/SIGINT.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The kube client cannot open TLS connections without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [GpuWorkload::crd(), GpuPool::crd(), Gpu::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Install or update the gpufleet CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    for crd in [GpuWorkload::crd(), GpuPool::crd(), Gpu::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All gpufleet CRDs installed/updated");
    Ok(())
}

/// Rebuild in-memory reservations from what is already running
///
/// GPU claims and host ports live only in this process; after a restart they
/// are recovered from the annotations on existing worker pods before the
/// controller may allocate anything new.
async fn restore_reservations(
    client: &Client,
    allocator: &InventoryAllocator,
    ports: &HostPortAllocator,
) -> anyhow::Result<()> {
    allocator
        .sync_from_cluster(client)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list GPUs: {}", e))?;

    let workloads = Api::<GpuWorkload>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list GpuWorkloads: {}", e))?
        .items;
    let pods = Api::<Pod>::all(client.clone())
        .list(&ListParams::default().labels(WORKLOAD_LABEL))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list worker pods: {}", e))?
        .items;

    allocator.restore(&workloads, &pods);
    ports.restore(&pods);
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let telemetry = init_telemetry(config.telemetry())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    tracing::info!("gpufleet controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let startup_retry = RetryConfig::with_max_attempts(10);

    // Operator installs its own CRDs on startup
    retry_with_backoff(&startup_retry, "install CRDs", || ensure_crds_installed(&client)).await?;

    let allocator = Arc::new(InventoryAllocator::new());
    let ports = Arc::new(HostPortAllocator::new(
        config.port_range_start,
        config.port_range_end,
    ));
    retry_with_backoff(&startup_retry, "restore reservations", || {
        restore_reservations(&client, &allocator, &ports)
    })
    .await?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(&config)
            .allocator(allocator.clone())
            .ports(ports)
            .build(),
    );

    tracing::info!("Starting gpufleet controllers:");
    let refresh = tokio::spawn(runner::build_inventory_refresh(
        client.clone(),
        allocator,
        config.inventory_refresh(),
    ));

    runner::build_workload_controller(client, ctx).await;

    refresh.abort();
    tracing::info!("gpufleet controller shutting down");
    telemetry.shutdown();
    Ok(())
}
