//! Dex Operator
//!
//! Main entry point for the operator. Loads configuration, installs the
//! shared cluster role, and runs the DexServer reconciliation loop next to
//! the metrics server.

use anyhow::Context as _;
use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dex_operator::{
    adapters::rbac_builder::build_cluster_role,
    cluster::{KubeApplier, Manifest, ManifestApplier},
    config::OperatorConfig,
    controllers::{dexserver_controller, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting Dex Operator");

    // Missing settings stop the process before any controller starts
    let config = OperatorConfig::from_env()?;
    info!("Using Dex image {}", config.dex_image);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Cluster role shared by every Dex instance
    let cluster_role = Manifest::ClusterRole(build_cluster_role());
    KubeApplier::new(client.clone())
        .apply_direct(&cluster_role)
        .await
        .context("failed to install the Dex cluster role")?;
    info!("Installed cluster role for Dex servers");

    let metrics_port = config.metrics_port;

    // Create shared context
    let context = Context::new(client, config);

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);
    metrics::OPERATOR_HEALTH.set(1.0);

    // Run the DexServer controller
    let controller_handle = tokio::spawn(dexserver_controller::run(context));

    // Handle graceful shutdown
    tokio::select! {
        _ = controller_handle => {
            error!("DexServer controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    metrics::OPERATOR_HEALTH.set(0.0);
    info!("Dex Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dex_operator=debug,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
