use backup_engine::config::AppConfig;
use backup_engine::db::connection::create_pool;
use backup_engine::db::migrate::migrate;
use backup_engine::routes;
use backup_engine::services::reconcile;
use backup_engine::services::scheduler::{Scheduler, SystemClock};
use backup_engine::source::file_tree::FileTreeSource;
use backup_engine::source::sqlite_db::SqliteDbSource;
use backup_engine::source::StateSource;
use backup_engine::state::AppState;
use backup_engine::store::ArtifactStore;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting backup engine on port {}", config.port);

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize catalog database
    let db_path = config.catalog_db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path);
    migrate(&pool, &config.artifacts_dir, &config.work_dir)?;

    // Artifact store (sweeps partial writes from a previous process)
    let store = ArtifactStore::new(&config.artifacts_dir);
    store.init().await?;

    // Registered state sources, in export order: structured data first,
    // file areas after.
    let sources: Vec<Arc<dyn StateSource>> = vec![
        Arc::new(SqliteDbSource::new("records", &config.app_db_path)),
        Arc::new(FileTreeSource::new("uploads", &config.uploads_dir)),
    ];
    for source in &sources {
        tracing::info!(source = %source.name(), "Registered state source");
    }

    // Build application state
    let state = Arc::new(AppState::new(pool, config.clone(), store, sources));

    // Reconcile catalog and store before accepting any request
    reconcile::run(&state).await?;

    // Start the scheduler state machine
    let scheduler_handle = Scheduler::new(state.clone(), Arc::new(SystemClock)).spawn();

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    state.shutdown.cancel();
    let _ = scheduler_handle.await;

    // Close catalog database
    backup_engine::db::connection::close_pool(&state.db);
    tracing::info!("Engine stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
