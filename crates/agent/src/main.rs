//! Batch Agent - batch cycle monitor for automation endpoints
//!
//! Keeps a supervised session to one endpoint, tracks the batch cycles of a
//! watched machine signal and publishes throughput predictions as logs,
//! metrics and CSV records.

use agent_lib::{
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    session::{MachineDriver, SimulatedEndpoint},
    sink::{RecordSink, DEFAULT_SINK_CAPACITY},
    supervisor::SupervisorBuilder,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting batch-agent");

    // Load configuration
    let config = config::AgentConfig::load()?;
    let logger = StructuredLogger::new(&config.station_name);

    let endpoint = config.endpoint().map_err(|e| {
        logger.log_fatal(&e);
        e
    })?;
    let supervisor_config = config.supervisor().map_err(|e| {
        logger.log_fatal(&e);
        e
    })?;
    info!(station = %config.station_name, endpoint = %endpoint.url, "Agent configured");

    let health_registry = HealthRegistry::new();
    let metrics = AgentMetrics::new();
    logger.log_startup(AGENT_VERSION, &endpoint.url);

    // Simulated endpoint serving every configured address
    let simulated =
        SimulatedEndpoint::with_credentials(endpoint.url.clone(), endpoint.credentials.clone());
    for address in config.simulated_addresses(&supervisor_config) {
        simulated.declare_address(&address);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let driver = MachineDriver::new(
        simulated.clone(),
        supervisor_config.watched.node.clone(),
        Duration::from_millis(config.simulation.active_ms),
        Duration::from_millis(config.simulation.idle_ms),
    );
    let driver_handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    // Record sinks
    let mut builder = SupervisorBuilder::new()
        .config(supervisor_config)
        .factory(Arc::new(simulated.connector(endpoint.credentials.clone())))
        .logger(logger.clone())
        .metrics(metrics.clone())
        .health(health_registry.clone());

    let mut sink_workers: Vec<JoinHandle<u64>> = Vec::new();
    if config.records.cycles.is_some() || config.records.samples.is_some() {
        health_registry.register(components::RECORD_SINK).await;
    }
    if let Some(path) = &config.records.cycles {
        match RecordSink::open(path, DEFAULT_SINK_CAPACITY) {
            Ok((sink, worker)) => {
                builder = builder.cycle_sink(sink);
                sink_workers.push(worker);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cycle records disabled");
                health_registry
                    .set_unhealthy(components::RECORD_SINK, e.to_string())
                    .await;
            }
        }
    }
    if let Some(path) = &config.records.samples {
        match RecordSink::open(path, DEFAULT_SINK_CAPACITY) {
            Ok((sink, worker)) => {
                builder = builder.sample_sink(sink);
                sink_workers.push(worker);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Sample records disabled");
                health_registry
                    .set_unhealthy(components::RECORD_SINK, e.to_string())
                    .await;
            }
        }
    }

    let supervisor = builder.build()?;

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        supervisor.snapshots(),
    ));

    // Start health and metrics server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let mut supervisor_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    };

    // Wait for shutdown signal or a fatal supervisor error
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        outcome = &mut supervisor_handle => Some(outcome),
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            logger.log_shutdown("SIGINT received");
            let _ = shutdown_tx.send(());
            supervisor_handle.await
        }
    };

    let _ = shutdown_tx.send(());
    api_handle.abort();
    let _ = driver_handle.await;

    // The supervisor owned the last sink handles; drain the writers
    for worker in sink_workers {
        if let Ok(rows) = worker.await {
            info!(rows = rows, "Record sink drained");
        }
    }

    let report = outcome??;
    info!(
        sessions = report.sessions,
        failures = report.failures,
        cycles = report.cycles_completed,
        "Shutting down"
    );

    Ok(())
}
