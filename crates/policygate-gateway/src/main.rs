//! PolicyGate Gateway
//!
//! Enforces policy-engine verdicts on template registrations and
//! source-control webhooks, failing closed whenever no explicit allow is
//! returned.

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{info, warn};

use policygate_gateway::{create_router, AppState, Cli, GatewayConfig, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(&cli.config, &cli)?;

    init_tracing(cli.verbose, config.logging.format);

    info!("Starting PolicyGate Gateway");
    info!("Configuration loaded from {}", cli.config);

    let metrics_handle = init_metrics()?;

    // Refuses to start without a usable engine URL
    let state = AppState::from_config(&config)?.with_metrics_handle(metrics_handle);
    let dispatcher = state.dispatcher.clone();
    info!("Application state initialized");

    let addr: SocketAddr = format!("{}:{}", config.server.listen, config.server.port).parse()?;
    let app = create_router(state, config.server.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on http://{}", addr);

    let shutdown = async {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping server...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Draining side-effect queue");
    dispatcher.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, format: LogFormat) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("policygate=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("policygate=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(
        "policygate_requests_total",
        "Total number of requests received by route"
    );
    metrics::describe_counter!(
        "policygate_decisions_total",
        "Total number of enforcement outcomes by route and outcome"
    );
    metrics::describe_histogram!(
        "policygate_pipeline_latency_us",
        metrics::Unit::Microseconds,
        "End-to-end enforcement latency in microseconds by route"
    );
    metrics::describe_histogram!(
        "policygate_engine_latency_us",
        metrics::Unit::Microseconds,
        "Policy engine round-trip latency in microseconds"
    );
    metrics::describe_counter!(
        "policygate_engine_errors_total",
        "Policy engine failures by class"
    );
    metrics::describe_counter!(
        "policygate_side_effects_total",
        "Side-effect executions by effect and status"
    );

    info!("Metrics exporter initialized");
    Ok(handle)
}
