/// Server setup and initialization
///
/// Wires together all components: storage, registry, execution state, run
/// ledger, dispatch channel, worker pool, coordinator and HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_run_routes, create_trigger_routes, create_workflow_routes, AppState},
    config::Config,
    runtime::{
        consumer::spawn_completion_consumer,
        coordinator::Coordinator,
        dispatch::InProcessDispatch,
        kv::{spawn_sweeper, KeyValueStore, MemoryKvStore},
        ledger::SqliteRunLedger,
        state::ExecutionStateStore,
        worker::{default_handlers, NodeHandler, WorkerPool},
    },
    workflow::{
        registry::WorkflowRegistry,
        storage::{self, WorkflowStorage},
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main Axum application with all routes and middleware
///
/// Opens the database under the configured data directory and runs nodes
/// with the built-in handlers.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Using data directory: {}", config.database.data_dir);
    let pool = storage::connect(&config.database.data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    let state = build_state(&config, pool, default_handlers()).await?;
    Ok(build_router(state))
}

/// Initialize every component on `pool` and start the background tasks
///
/// Workers, the completion consumer and the state sweeper run detached for
/// the lifetime of the process.
pub async fn build_state(
    config: &Config,
    pool: SqlitePool,
    handlers: Vec<Arc<dyn NodeHandler>>,
) -> Result<AppState> {
    // Initialize workflow storage and run ledger (same database)
    tracing::info!("📋 Initializing workflow storage");
    let workflow_storage = WorkflowStorage::new(pool.clone());
    workflow_storage.init_schema().await?;

    tracing::info!("📒 Initializing run ledger");
    let ledger = SqliteRunLedger::new(pool);
    ledger.init_schema().await?;

    // Initialize workflow registry and load existing workflows
    tracing::info!("📊 Initializing workflow registry");
    let workflow_registry = Arc::new(WorkflowRegistry::new(workflow_storage.clone()));

    tracing::info!("📥 Loading existing workflows from storage");
    workflow_registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    // Ephemeral per-run state with TTL and a background sweep
    tracing::info!(
        "🗃️ Initializing execution state store (ttl {:?})",
        config.execution.state_ttl()
    );
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    spawn_sweeper(Arc::clone(&kv), config.execution.sweep_interval());
    let state_store = ExecutionStateStore::new(kv, config.execution.state_ttl());

    // Dispatch channel with one partition per worker
    let parallelism = config.workers.parallelism();
    tracing::info!("🔀 Initializing dispatch channel: {:?}", parallelism);
    let (dispatch, receivers) = InProcessDispatch::new(&parallelism, config.workers.queue_capacity);
    let dispatch = Arc::new(dispatch);

    tracing::info!("👷 Starting worker pool");
    let workers = WorkerPool::new(handlers, dispatch.clone());
    let worker_handles = workers.spawn(receivers.requests);
    tracing::debug!("Spawned {} worker tasks", worker_handles.len());

    tracing::info!("🚀 Initializing coordinator");
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&workflow_registry),
        state_store,
        Arc::new(ledger),
        dispatch,
        config.execution.coordinator_settings(),
    ));

    spawn_completion_consumer(Arc::clone(&coordinator), receivers.completions);

    Ok(AppState {
        storage: workflow_storage,
        registry: workflow_registry,
        coordinator,
    })
}

/// All HTTP routes over `state`
pub fn build_router(state: AppState) -> Router {
    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Workflow management API routes
        .merge(create_workflow_routes())
        // Run start, sync wait and record lookup
        .merge(create_run_routes())
        // External triggers and resume-at-node
        .merge(create_trigger_routes())
        .with_state(state)
}

/// Start the HTTP server with the given configuration
///
/// Creates the application and starts the Axum server on the configured address and port.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowrelay coordinator...");

    let app = create_app(config.clone()).await?;

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
