//! # NixOS Infrastructure Controller
//!
//! Binary entry point: wires configuration, observability, the Kubernetes
//! client and both control loops together, then runs until a termination
//! signal drains the reconcilers.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::{watcher, Controller};
use tracing::{error, info};

use nixos_infra_controller::config::ControllerConfig;
use nixos_infra_controller::context::ControllerContext;
use nixos_infra_controller::controller::{configuration, gc, machine};
use nixos_infra_controller::crd::{Machine, NixosConfiguration};
use nixos_infra_controller::known_hosts::KnownHostsStore;
use nixos_infra_controller::observability::metrics;
use nixos_infra_controller::server::{start_health_server, start_metrics_server, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nixos_infra_controller=info".into()),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_GIT_HASH"),
        "starting NixOS Infrastructure Controller"
    );

    // The controller image ships nix under the default profile; make sure
    // subprocesses resolve it.
    let nix_bin_path = "/nix/var/nix/profiles/default/bin";
    let current_path = std::env::var("PATH").unwrap_or_default();
    if !current_path.split(':').any(|p| p == nix_bin_path) {
        std::env::set_var("PATH", format!("{nix_bin_path}:{current_path}"));
        info!("added nix profile to PATH: {nix_bin_path}");
    }

    let config = ControllerConfig::from_env().context("failed to load configuration")?;
    info!("{}", config.summary());

    metrics::register_metrics().context("failed to register metrics")?;

    let server_state = ServerState::new();

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_port).await {
            error!("metrics server error: {e}");
        }
    });

    let health_port = config.health_port;
    let health_state = server_state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_port, health_state).await {
            error!("health server error: {e}");
        }
    });

    // A controller without an API server is useless; this is the one
    // failure that exits non-zero instead of degrading.
    let client = Client::try_default()
        .await
        .context("failed to initialize Kubernetes client")?;

    let known_hosts = KnownHostsStore::open(&config.known_hosts_path)
        .context("failed to open known_hosts store")?;

    let ctx = Arc::new(ControllerContext::new(client.clone(), config, known_hosts));

    tokio::spawn(gc::run(ctx.clone()));

    // Watch both resource kinds across all namespaces.
    let machines: Api<Machine> = Api::all(client.clone());
    let configurations: Api<NixosConfiguration> = Api::all(client.clone());

    server_state.mark_ready();

    let machine_controller = Controller::new(machines, watcher::Config::default())
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, ctx.clone())
        .for_each(|_| std::future::ready(()));

    let configuration_controller = Controller::new(configurations, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            configuration::reconcile,
            configuration::error_policy,
            ctx.clone(),
        )
        .for_each(|_| std::future::ready(()));

    futures::join!(machine_controller, configuration_controller);

    server_state.mark_not_ready();
    info!("controller stopped");
    Ok(())
}
