use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info, warn};

use consul_registrator::drivers::{ContainerDriver, HttpContainerDriver, HttpRegistryDriver};
use consul_registrator::reconcile::normalizer::NormalizerConfig;
use consul_registrator::reconcile::{Reconciler, Scheduler, SidecarConfig};
use consul_registrator::{telemetry, Config, Metrics};

/// Bridges a container runtime and a service-registry/service-mesh agent,
/// launching and removing mesh-proxy sidecars as services opt in (spec §1).
#[derive(Debug, Parser)]
#[command(name = "consul-registrator", version)]
struct Cli {
    /// Run exactly one reconciliation cycle and exit.
    #[arg(long)]
    once: bool,

    /// Exit 0 iff the container driver responds within 2 seconds, without
    /// running a reconciliation cycle.
    #[arg(long)]
    healthcheck: bool,

    /// Forwarded to both drivers: log mutations instead of performing them.
    #[arg(long)]
    dry_run: bool,
}

/// Web-server state: just the metrics registry, mirroring the teacher's
/// `State { registry: prometheus::Registry }` (minus the diagnostics this
/// daemon reports via structured logs instead — spec §9 "Supplemented").
#[derive(Clone)]
struct WebState {
    registry: Registry,
}

async fn metrics_handler(State(state): State<WebState>) -> impl IntoResponse {
    let families = state.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
    }
    ([("content-type", encoder.format_type().to_string())], buffer)
}

async fn health_handler() -> impl IntoResponse {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };
    let dry_run = config.dry_run || cli.dry_run;

    let container_driver: Arc<dyn ContainerDriver> =
        Arc::new(HttpContainerDriver::with_dry_run(config.docker_sock.clone(), dry_run));

    if cli.healthcheck {
        return run_healthcheck(container_driver.as_ref()).await;
    }

    let registry_driver = Arc::new(HttpRegistryDriver::with_dry_run(
        config.consul_http_addr.clone(),
        config.consul_http_token.as_deref(),
        dry_run,
    ));

    let prometheus_registry = Registry::new();
    let metrics = Metrics::default()
        .register(&prometheus_registry)
        .expect("metric registration only fails on duplicate registration at startup");

    let normalizer_config = NormalizerConfig {
        sidecar_prometheus_bind_addr: config.sidecar_prometheus_bind_addr.clone(),
        agent_id: config.agent_id.clone(),
    };
    let sidecar_config = SidecarConfig {
        enabled: config.sidecar_enabled,
        image: config.sidecar_image.clone(),
        consul_http: config.sidecar_consul_http.clone(),
        consul_grpc: config.sidecar_consul_grpc.clone(),
        grpc_tls: config.sidecar_grpc_tls,
        grpc_ca_file: config.sidecar_grpc_ca_file.clone(),
    };

    let reconciler = Reconciler::new(
        container_driver,
        registry_driver,
        config.state_path.clone(),
        normalizer_config,
        sidecar_config,
        config.agent_id.clone(),
        metrics,
    );

    if cli.once {
        let scheduler = Scheduler::new(reconciler, Duration::from_secs(10), None);
        match scheduler.run_once().await {
            Ok(report) => {
                info!(?report, "single cycle complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "cycle failed");
                std::process::exit(1);
            }
        }
    } else {
        let scheduler = Scheduler::new(reconciler, Duration::from_secs(10), Some(config.clean_interval));

        let web_state = WebState { registry: prometheus_registry };
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(web_state);
        let listener = tokio::net::TcpListener::bind(&config.metrics_addr).await?;
        let server = axum::serve(listener, app);

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    warn!(error = %e, "metrics server exited");
                }
            }
            _ = scheduler.run(shutdown_signal()) => {}
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install signal handler, running without graceful shutdown");
        std::future::pending::<()>().await;
    }
}

async fn run_healthcheck(container_driver: &dyn ContainerDriver) -> anyhow::Result<()> {
    match tokio::time::timeout(Duration::from_secs(2), container_driver.list(false)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "healthcheck failed");
            std::process::exit(1);
        }
        Err(_) => {
            error!("healthcheck timed out after 2s");
            std::process::exit(1);
        }
    }
}
