use flowgate_engine::{
    Engine,
    api::{self, AppState},
    config::EngineConfig,
    db::PgDefinitionSource,
    error::StartupError,
    handlers,
};
use flowgate_scheduler::ExpirySweeper;
use flowgate_workflow::{ExecutionStore, NatsExecutionStore, Orchestrator};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(report) = run().await {
        tracing::error!(error = %report, "engine stopped");
        std::process::exit(1);
    }
}

async fn run() -> flowgate_core::Result<(), StartupError> {
    // Load configuration from environment
    let config = EngineConfig::from_env().map_err(|e| StartupError::Config {
        details: e.to_string(),
    })?;
    tracing::info!("Loaded configuration");

    // Definitions live in PostgreSQL
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .map_err(|e| StartupError::Database {
            details: e.to_string(),
        })?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|e| StartupError::Migration {
            details: e.to_string(),
        })?;

    // Executions live in NATS KV
    let store = NatsExecutionStore::connect(&config.nats.store_config())
        .await
        .map_err(|e| StartupError::ExecutionStore {
            details: e.to_string(),
        })?;
    tracing::info!(bucket = %config.nats.bucket, "Opened execution store");

    let store: Arc<dyn ExecutionStore> = Arc::new(store);
    let engine: Arc<Engine> = Arc::new(Orchestrator::new(store, handlers::default_registry()));

    // Pick up whatever a previous process left running
    let recovery = engine
        .recover_running()
        .await
        .map_err(|e| StartupError::Recovery {
            details: e.to_string(),
        })?;
    for (id, error) in &recovery.failed {
        tracing::warn!(execution_id = %id, error = %error, "Failed to resume execution");
    }
    tracing::info!(
        resumed = recovery.resumed.len(),
        failed = recovery.failed.len(),
        "Resumed running executions"
    );

    let sweeper = ExpirySweeper::new(Arc::clone(&engine))
        .with_interval(config.sweep.interval())
        .spawn();

    let state = AppState::new(engine, Arc::new(PgDefinitionSource::new(db_pool)));
    let app = api::router(state);

    let addr = config.http.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: addr.clone(),
            details: e.to_string(),
        })?;

    tracing::info!("listening on http://{}", addr);

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;
    sweeper.abort();
    served.map_err(|e| StartupError::Serve {
        details: e.to_string(),
    })?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
