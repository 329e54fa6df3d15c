//! SLM Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use slm_manager::{
    api,
    artifacts::{
        ArtifactResolver,
        hub::{HubRegistry, HubRepository, hub_api},
    },
    catalog::Catalog,
    config::ManagerConfig,
    device::{FixedMemoryProbe, MemoryProbe, SystemMemoryProbe},
    dispatch::ModelDispatcher,
    engine::ServerEngineFactory,
    lifecycle::ModelLifecycleManager,
    memory::MemoryService,
    metrics,
    router::IntentRouter,
    storage::FileSystemStorage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "slm-manager")]
#[command(about = "On-device small language model manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override local model directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Override vector store snapshot directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting SLM Manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(dir) = cli.models_dir {
        config.models_dir = dir;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        data_dir = ?config.data_dir,
        models_dir = ?config.models_dir,
        embedding_model = %config.embedding_model,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let catalog = Arc::new(Catalog::with_extra(config.models.clone()));
    let probe: Arc<dyn MemoryProbe> = match config.device_ram_bytes {
        Some(bytes) => Arc::new(FixedMemoryProbe(bytes)),
        None => Arc::new(SystemMemoryProbe),
    };

    // Artifact resolution: registry, local scan, repository download
    let engines = Arc::new(ServerEngineFactory::new(
        config.engine.primary.clone(),
        config.engine.fallback.clone(),
        config.engine.start_timeout(),
    ));
    let hub = hub_api(config.hub_cache_dir.clone()).context("Failed to build hub client")?;
    let resolver = ArtifactResolver::new(engines, config.models_dir.clone())
        .with_registry(Arc::new(HubRegistry::new(
            hub.clone(),
            config.registry_org.clone(),
        )))
        .with_repository(Arc::new(HubRepository::new(hub)));

    let mut lifecycle = ModelLifecycleManager::new(catalog.clone(), probe, Arc::new(resolver));
    if !config.profiles.is_empty() {
        lifecycle = lifecycle.with_profiles(config.profiles.clone());
    }
    let lifecycle = Arc::new(lifecycle);
    lifecycle.init().await;

    let events_handle = tokio::spawn({
        let mut events = lifecycle.subscribe_events();
        async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracing::debug!(event = ?event, "Lifecycle event"),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Lifecycle event log lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    let router = Arc::new(IntentRouter::new(&catalog, config.router.clone()));
    let dispatcher = Arc::new(ModelDispatcher::new(router, lifecycle.clone()));

    let memory = Arc::new(MemoryService::new(
        lifecycle.clone(),
        &config.embedding_model,
        config.memory.clone(),
        &config.data_dir,
        Arc::new(FileSystemStorage::new()),
    ));
    let flushers = memory.spawn_flushers(config.persist_debounce());

    // Setup API
    let app_state = api::AppState {
        lifecycle: lifecycle.clone(),
        dispatcher,
        memory: memory.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Flush vector stores
    tracing::info!("Flushing vector stores");
    for flusher in flushers {
        flusher.shutdown().await;
    }
    memory.shutdown().await;

    // Stop all engines
    tracing::info!("Releasing all models");
    lifecycle.release_all().await;

    events_handle.abort();

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
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
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
