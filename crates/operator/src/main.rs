#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cao_kubehub::{ClusterClient, KubeClusterClient};
use cao_runtime::{DrainOutcome, Manager};
use cao_schema::{apis, RegistryBuilder};

mod config;

use config::Config;

fn init_tracing(json: bool) {
    let env = std::env::var("CAO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

/// Cancel `shutdown` on the first SIGTERM or SIGINT.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM; draining"),
            _ = sigint.recv() => info!("received SIGINT; draining"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}

async fn run(cfg: Config) -> Result<DrainOutcome> {
    let client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::try_default().await.context("connecting to the cluster API")?);

    let mut registry = RegistryBuilder::new();
    apis::add_to_registry(&mut registry).context("registering operator kinds")?;

    let mut manager = Manager::new(client, registry.build(), cfg.manager_options());
    cao_controllers::add_to_manager(&mut manager, cfg.cluster_autoscaler(), cfg.controller_options())
        .context("registering controllers")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    info!(
        namespace = cfg.namespace().as_deref().unwrap_or("*"),
        controllers = ?manager.controller_names(),
        workers = cfg.workers,
        "starting operator"
    );
    let outcome = manager.start(shutdown).await.context("operator stopped with an error")?;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = Config::parse();
    init_tracing(cfg.log_json);
    init_metrics(cfg.metrics_addr.as_deref());

    match run(cfg).await {
        Ok(DrainOutcome::Clean) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            warn!(?outcome, "shutdown forced after drain timeout");
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "operator failed");
            ExitCode::FAILURE
        }
    }
}
