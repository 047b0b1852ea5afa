//! Ingestion service binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `chaintwin.yaml` (or `CHAINTWIN_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Connect the `Dragonfly` cache
//! 5. Connect to NATS and pick the alert channel
//! 6. Assemble the ingestion gateway
//! 7. Start the read API
//! 8. Run the intake until shutdown, draining in-flight events

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chaintwin_core::config::AlertSink;
use chaintwin_core::{
    AlertChannel, ConflictResolver, ErrorReporter, GatewaySettings, IngestionGateway, TwinConfig,
};
use chaintwin_db::{CacheBackend, CacheLayer, DragonflyPool, NodeRepository, NodeStore, PostgresPool};
use chaintwin_ingest::{AppState, ServerConfig, ServerError, run_intake, start_server};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "CHAINTWIN_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "chaintwin.yaml";

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration.
    let (config, config_path) = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config);
    info!("chaintwin-ingest starting");
    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file found, using defaults"),
    }

    // 3. Connect to PostgreSQL.
    let pg = PostgresPool::connect(&config.infrastructure.postgres_url, config.ingest.store_timeout())
        .await
        .context("connecting to PostgreSQL")?;
    pg.run_migrations().await.context("running migrations")?;
    info!("PostgreSQL connected, migrations applied");

    // 4. Connect the cache.
    let dragonfly = DragonflyPool::new(&config.infrastructure.dragonfly_url)
        .context("configuring Dragonfly client")?;
    let cache = CacheLayer::new(CacheBackend::Dragonfly(dragonfly))
        .with_timeout(config.ingest.store_timeout());
    cache.connect().await.context("connecting to Dragonfly")?;
    info!("Dragonfly cache connected");

    let repository = NodeRepository::new(NodeStore::Postgres(pg.clone()), cache.clone())
        .with_timeout(config.ingest.store_timeout())
        .with_node_ttl(config.cache.node_ttl());

    // 5. Connect to NATS and pick the alert channel.
    let nats_url = &config.infrastructure.nats_url;
    info!(nats_url = nats_url.as_str(), "Connecting to NATS");
    let nats = async_nats::connect(nats_url.as_str())
        .await
        .with_context(|| format!("connecting to NATS at {nats_url}"))?;
    info!("NATS connection established");

    let channel = match config.alerts.channel {
        AlertSink::Log => AlertChannel::LogOnly,
        AlertSink::Memory => AlertChannel::in_memory(),
        AlertSink::Nats => AlertChannel::Nats {
            client: nats.clone(),
            subject: config.alerts.subject.clone(),
        },
    };
    info!(channel = ?config.alerts.channel, "Alert channel selected");
    let reporter = ErrorReporter::new(channel);

    // 6. Assemble the gateway.
    let resolver = ConflictResolver::new(
        config.ingest.resolution_policy(),
        config.ingest.conflict_window(),
    );
    let gateway = IngestionGateway::new(
        repository.clone(),
        resolver,
        reporter.clone(),
        GatewaySettings::from_config(&config.ingest),
    );
    info!(
        conflict_window_secs = config.ingest.conflict_window_secs,
        max_concurrency_retries = config.ingest.max_concurrency_retries,
        max_connectivity_attempts = config.ingest.max_connectivity_attempts,
        block_on_discrepancy = config.ingest.block_on_discrepancy,
        "Ingestion gateway ready"
    );

    // 7. Start the read API.
    let state = Arc::new(AppState::new(
        repository,
        cache.clone(),
        reporter.alert_store(),
    ));
    let server_config = ServerConfig::on_port(config.infrastructure.api_port);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        start_server(&server_config, state, async move {
            let _ = stop_rx.await;
        })
        .await
    });

    // 8. Run the intake until shutdown, then drain it.
    let mut server_exited = false;
    let intake = run_intake(
        nats,
        &config.ingest.subject,
        &gateway,
        config.ingest.max_in_flight,
        async {
            tokio::select! {
                result = &mut server => {
                    log_server_exit(result);
                    server_exited = true;
                }
                _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
            }
            info!("Draining in-flight events");
        },
    );
    if let Err(e) = intake.await {
        error!(error = %e, "Ingestion intake failed");
    }

    if !server_exited {
        let _ = stop_tx.send(());
        log_server_exit(server.await);
    }
    if let Err(e) = cache.disconnect().await {
        warn!(error = %e, "Cache disconnect failed");
    }
    pg.close().await;
    info!("chaintwin-ingest stopped");
    Ok(())
}

/// Read the configuration file, falling back to defaults when it is absent.
fn load_config() -> anyhow::Result<(TwinConfig, Option<PathBuf>)> {
    let path = std::env::var(CONFIG_ENV)
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        let config = TwinConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        Ok((config, Some(path)))
    } else {
        let config = TwinConfig::parse("{}").context("loading default configuration")?;
        Ok((config, None))
    }
}

fn log_server_exit(result: Result<Result<(), ServerError>, JoinError>) {
    match result {
        Ok(Ok(())) => info!("Read API stopped"),
        Ok(Err(e)) => error!(error = %e, "Read API failed"),
        Err(e) => error!(error = %e, "Read API task panicked"),
    }
}

fn init_tracing(config: &TwinConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
