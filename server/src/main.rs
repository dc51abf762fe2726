//! Workshop Server
//!
//! Serves the session and cluster registry HTTP API and runs the expiry
//! sweep and cluster health monitor in the background.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use workshop_server::domain::template::WorkshopTemplate;
use workshop_server::infra::docker::{ContainerEngine, DockerEngine};
use workshop_server::infra::process::TokioProcessRunner;
use workshop_server::infra::session_store::InMemorySessionStore;
use workshop_server::infra::sqlite::SqliteStore;
use workshop_server::infra::store::Store;
use workshop_server::provider::cluster::{ClusterLeases, ClusterSource};
use workshop_server::provider::ProviderFactory;
use workshop_server::service::background::{spawn_health_monitor, spawn_session_sweeper};
use workshop_server::service::registry::ClusterRegistry;
use workshop_server::service::session::SessionOrchestrator;
use workshop_server::{api, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::load()?);

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    info!("Starting Workshop Server");
    info!("HTTP listening on {}", http_addr);

    // Initialize infrastructure
    let pool = SqliteStore::init(&config.database_url).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    if let Some(dir) = &config.templates_dir {
        seed_templates(store.as_ref(), Path::new(dir)).await;
    }

    let runner = Arc::new(TokioProcessRunner::new());
    let engine: Option<Arc<dyn ContainerEngine>> =
        match DockerEngine::new(config.docker_socket.as_deref()) {
            Ok(engine) => match engine.ping().await {
                Ok(()) => Some(Arc::new(engine) as Arc<dyn ContainerEngine>),
                Err(e) => {
                    warn!("Docker daemon unreachable, container backend disabled: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Docker client unavailable, container backend disabled: {}", e);
                None
            }
        };

    // Initialize services
    let leases = Arc::new(ClusterLeases::new());
    let registry = Arc::new(ClusterRegistry::new(
        store.clone(),
        runner.clone(),
        leases.clone(),
        &config,
    ));
    let clusters: Arc<dyn ClusterSource> = registry.clone();
    let factory = Arc::new(ProviderFactory::new(
        config.clone(),
        runner,
        engine,
        Some(clusters),
        leases,
    ));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        store,
        Arc::new(InMemorySessionStore::new()),
        factory.clone(),
        config.clone(),
    ));

    // Background loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_session_sweeper(
        orchestrator.clone(),
        config.sweep_interval(),
        shutdown_rx.clone(),
    );
    let monitor = spawn_health_monitor(
        registry.clone(),
        config.health_check_interval(),
        shutdown_rx,
    );

    let state = AppState {
        config: config.clone(),
        orchestrator: orchestrator.clone(),
        registry,
        factory: factory.clone(),
    };
    let app = api::http::create_router(state);

    let result = axum::serve(
        tokio::net::TcpListener::bind(http_addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Open follow streams would otherwise hold the server open
        orchestrator.close_streams();
    })
    .await;
    if let Err(e) = result {
        error!("HTTP server error: {}", e);
    }

    let _ = shutdown_tx.send(true);
    for task in [sweeper, monitor] {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
    factory.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Load every `*.json` template in `dir`; unreadable or invalid files are skipped
async fn seed_templates(store: &dyn Store, dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read templates directory {:?}: {}", dir, e);
            return;
        }
    };

    let mut loaded = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to list templates directory {:?}: {}", dir, e);
                break;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let template = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<WorkshopTemplate>(&raw),
            Err(e) => {
                warn!("Skipping template {:?}: {}", path, e);
                continue;
            }
        };
        match template {
            Ok(template) => match store.put_template(&template).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Failed to store template {}: {}", template.id, e),
            },
            Err(e) => warn!("Skipping invalid template {:?}: {}", path, e),
        }
    }
    info!("Loaded {} template(s) from {:?}", loaded, dir);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Received shutdown signal");
}
