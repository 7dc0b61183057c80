//! NVSentinel
//!
//! Cluster-level GPU fleet reliability: producer signals become durable
//! HealthEvent records that the quarantine, drain, remediation and TTL
//! controllers drive through the lifecycle pipeline, moving workloads off
//! faulty hardware and handing nodes back once they recover.

mod cli;
mod config;
mod maintenance;

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::Registry;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::{Config, StorageMode};
use maintenance::{MaintenancePoller, NodeAnnotationApi};
use nvsentinel_core::controllers::{
    BackoffConfig, ControllerRunner, DrainController, NodeAdmin, PodEvictor,
    QuarantineController, RemediationController, RunnerConfig, TtlController,
};
use nvsentinel_core::metrics::{
    DrainMetrics, PublisherMetrics, QuarantineMetrics, RemediationMetrics, RunnerMetrics,
    TtlMetrics,
};
use nvsentinel_core::publisher::{Publisher, PublisherConfig};
use nvsentinel_core::records::RecordStore;
use nvsentinel_core::store::MemoryStore;
use nvsentinel_core::xid;
use nvsentinel_k8s::{K8sClient, NodeOperator};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Run the lifecycle pipeline until shutdown.
async fn run(config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    if config.storage.mode == StorageMode::External {
        // The embedded store is the only backend compiled into this binary;
        // external mode points the device API at a real key-value cluster.
        anyhow::bail!(
            "storage.mode=external is not supported by this build; use the in-memory store"
        );
    }

    let store = Arc::new(MemoryStore::new());
    let records = RecordStore::new(store);
    let registry = Registry::new();

    let k8s_client = K8sClient::new().await?;
    k8s_client
        .health_check()
        .await
        .context("Kubernetes API server unreachable")?;

    let operator = Arc::new(NodeOperator::new(
        k8s_client.clone(),
        config.drain.system_namespaces.clone(),
        config.dry_run,
    ));
    let node_admin: Arc<dyn NodeAdmin> = operator.clone();
    let pod_evictor: Arc<dyn PodEvictor> = operator;

    let runner_config = RunnerConfig {
        workers: config.reconcile.workers,
        timeout: config.reconcile.timeout,
        backoff: BackoffConfig {
            initial: config.reconcile.initial_backoff,
            max: config.reconcile.max_backoff,
        },
    };
    let runner_metrics =
        Arc::new(RunnerMetrics::new(&registry).context("Failed to register runner metrics")?);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Publisher fed by in-process producers
    let (signal_tx, signal_rx) = mpsc::channel(256);
    {
        let publisher = Publisher::new(
            records.clone(),
            PublisherMetrics::new(&registry).context("Failed to register publisher metrics")?,
            PublisherConfig {
                max_attempts: config.publisher.max_attempts,
                initial_backoff: config.reconcile.initial_backoff,
                max_backoff: config.reconcile.max_backoff,
                additional_ignored_codes: config.signal.additional_ignored_codes.clone(),
            },
        );
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            publisher.run(signal_rx, shutdown).await;
        }));
    }

    // The four controllers, each on its own runner
    let quarantine = Arc::new(QuarantineController::new(
        records.clone(),
        node_admin.clone(),
        QuarantineMetrics::new(&registry).context("Failed to register quarantine metrics")?,
    ));
    let drain = Arc::new(DrainController::new(
        records.clone(),
        pod_evictor,
        DrainMetrics::new(&registry).context("Failed to register drain metrics")?,
    ));
    let remediation = Arc::new(RemediationController::new(
        records.clone(),
        RemediationMetrics::new(&registry).context("Failed to register remediation metrics")?,
    ));
    let ttl = Arc::new(TtlController::new(
        records.clone(),
        node_admin,
        config.ttl.resolved_retention,
        TtlMetrics::new(&registry).context("Failed to register TTL metrics")?,
    ));

    macro_rules! spawn_runner {
        ($reconciler:expr) => {{
            let runner = ControllerRunner::new(
                records.clone(),
                runner_config.clone(),
                runner_metrics.clone(),
            );
            let shutdown = shutdown_rx.clone();
            let reconciler = $reconciler;
            tasks.push(tokio::spawn(async move {
                runner.run(reconciler, shutdown).await;
            }));
        }};
    }
    spawn_runner!(quarantine);
    spawn_runner!(drain);
    spawn_runner!(remediation);
    spawn_runner!(ttl);

    // Cloud maintenance poller, when the cluster surfaces notices
    if config.maintenance.enabled {
        let poller = MaintenancePoller::new(
            Arc::new(NodeAnnotationApi::new(k8s_client.clone())),
            signal_tx.clone(),
            config.maintenance.poll_interval,
            config.maintenance.fan_out,
        );
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            poller.run(shutdown).await;
        }));
    }
    // signal_tx stays alive for the lifetime of the pipeline; it is the
    // ingress any in-process producer writes to.
    let _signal_ingress = signal_tx;

    // Metrics endpoint
    if config.metrics.enabled {
        let port = config.metrics.port;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(port, registry).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    info!("NVSentinel pipeline running");

    for task in tasks {
        let _ = task.await;
    }

    info!("NVSentinel shutdown complete");
    Ok(())
}

/// Serve the registry over plain HTTP.
async fn serve_metrics(port: u16, registry: Registry) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let registry = registry.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = prometheus::TextEncoder::new()
                .encode_to_string(&registry.gather())
                .unwrap_or_default();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "NVSentinel starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if cli.dry_run {
        config.dry_run = true;
    }
    if let Some(raw) = &cli.additional_ignored_xids {
        let codes = xid::parse_code_list(raw);
        if !codes.is_empty() {
            config.signal.additional_ignored_codes.extend(codes);
        }
    }

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    info!(
        dry_run = config.dry_run,
        storage = ?config.storage.mode,
        "Configuration loaded"
    );

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    run(config, shutdown_rx).await
}
