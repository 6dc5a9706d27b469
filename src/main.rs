/// flowrelay: distributed workflow execution coordinator
///
/// Main entry point. Initializes configuration and starts the HTTP server.

use flowrelay::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow management API at /api/workflows/*
/// - Run start and synchronous wait at /api/workflows/{id}/run
/// - External triggers at /api/triggers/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (FLOWRELAY_* environment variables over defaults)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
