//! Nightjar export worker host.
//!
//! Wires the production collaborators (Postgres stores and reader,
//! Kafka publisher, shared-volume writers) into the orchestrator,
//! serves the health probes, and exits non-zero when a leader run
//! surfaces an unrecoverable error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

use nightjar_core::observability::{init_logging, LogFormat};
use nightjar_core::InstanceId;

use nightjar_worker::config::WorkerConfig;
use nightjar_worker::error::{Error, Result};
use nightjar_worker::health::{HealthService, HealthState};
use nightjar_worker::lease::postgres::PostgresLeaseStore;
use nightjar_worker::orchestrator::{Collaborators, Orchestrator, OutputTarget, RunPolicy};
use nightjar_worker::pg::connect_lazy;
use nightjar_worker::progress::postgres::PostgresProgressStore;
use nightjar_worker::publish::kafka::KafkaEventPublisher;
use nightjar_worker::reader::postgres::PostgresPageReader;
use nightjar_worker::translate::TranslatorRegistry;
use nightjar_worker::trigger::ProgressTriggerGuard;

fn log_format_from_env() -> LogFormat {
    match std::env::var("NIGHTJAR_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn resolve_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| Error::configuration("--config requires a path"));
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(PathBuf::from(path));
        }
    }

    if let Ok(path) = std::env::var("NIGHTJAR_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    Ok(PathBuf::from("nightjar.toml"))
}

fn resolve_port(key: &str, default: u16) -> Result<u16> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u16>()
            .map_err(|_| Error::configuration(format!("invalid {key}"))),
        Err(_) => Ok(default),
    }
}

fn install_metrics_recorder() -> Result<()> {
    let port = resolve_port("NIGHTJAR_METRICS_PORT", 9090)?;
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()
        .map_err(|e| Error::configuration(format!("failed to install metrics recorder: {e}")))
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("interrupt received; shutting down"),
        () = terminate => tracing::info!("terminate received; shutting down"),
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let config_path = resolve_config_path()?;
    let config = WorkerConfig::load(&config_path)?;
    let worker_id = config.worker_id()?;
    let instance_id = InstanceId::generate();

    install_metrics_recorder()?;

    // State stores share one pool; the source view gets its own.
    let state_pool = connect_lazy(&config.state_store.connection_string)?;
    let lease = Arc::new(PostgresLeaseStore::new(
        state_pool.clone(),
        &config.state_store.lease_table,
    )?);
    let progress = Arc::new(PostgresProgressStore::new(
        state_pool,
        &config.state_store.status_table,
    )?);

    if let Err(error) = lease.ensure_schema().await {
        tracing::warn!(error = %error, "lease schema check failed; continuing");
    } else if let Err(error) = lease.purge_expired().await {
        tracing::warn!(error = %error, "expired lease sweep failed; continuing");
    }
    if let Err(error) = progress.ensure_schema().await {
        tracing::warn!(error = %error, "status schema check failed; continuing");
    }

    let source_pool = connect_lazy(&config.source.connection_string)?;
    let reader = Arc::new(PostgresPageReader::new(
        source_pool,
        &config.source.view_name,
        &config.source.order_by,
        config.source.page_size,
    )?);

    let publisher = Arc::new(KafkaEventPublisher::connect(&config.bus).await?);
    let registry = Arc::new(TranslatorRegistry::with_defaults());

    let mut outputs = Vec::with_capacity(config.files.len());
    for file in &config.files {
        // Fail fast on unknown translator ids and invalid file ids.
        registry.resolve(&file.translator_id)?;
        outputs.push(OutputTarget::new(
            file.file_id()?,
            file.translator_id.clone(),
            config.output_root_path.clone(),
            file.file_name_pattern.clone(),
        ));
    }

    let trigger = Arc::new(ProgressTriggerGuard::new(
        progress.clone() as Arc<dyn nightjar_worker::progress::ProgressStore>,
        outputs.iter().map(|o| o.file_id.clone()).collect(),
        config.policy.daily_trigger_window(),
    ));

    let health_state = Arc::new(HealthState::new());
    let health = Arc::new(HealthService::new(
        worker_id.clone(),
        lease.clone(),
        progress.clone(),
        reader.clone(),
        health_state.clone(),
    ));

    let orchestrator = Orchestrator::new(
        worker_id.clone(),
        instance_id,
        RunPolicy::from(&config.policy),
        config.bus.event_type.clone(),
        outputs,
        Collaborators {
            lease,
            progress,
            reader,
            registry,
            publisher,
            trigger,
        },
        health_state,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let port = resolve_port("NIGHTJAR_PORT", 8080)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, worker_id = %worker_id, instance_id = %instance_id, "health server listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, health.router())
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(error) = result {
            tracing::error!(error = %error, "health server error");
        }
    });

    let outcome = orchestrator.run(shutdown.clone()).await;

    shutdown.cancel();
    let _ = server.await;

    outcome
}
