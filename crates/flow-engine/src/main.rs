//! Flowline control plane server.
//!
//! Serves the definition, flow, cancellation and simulation API. Flows are
//! advanced by separate `flow-worker` processes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flow_engine::{
    config::{AppConfig, DatabaseConfig, EngineConfig},
    db::{create_pool, ensure_schema},
    engine::{Clock, Interpreter, SystemClock},
    handlers,
    services::FlowService,
    simulation::Simulator,
    state::AppState,
    store::PgStore,
};
use flow_steps::steps::create_default_registry;

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flow_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application router with all routes.
fn build_router(state: AppState, flow_service: FlowService, simulator: Simulator) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health))
        .with_state(state);

    Router::new()
        .merge(health_routes)
        .merge(handlers::api_router(flow_service, simulator))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Flowline control plane"
    );

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    let engine_config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load engine config, using defaults");
        EngineConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        debug = app_config.debug,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    ensure_schema(&db_pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(PgStore::new(db_pool.clone()));
    let flow_service = FlowService::new(store.clone(), store, clock.clone());

    let interpreter = Interpreter::from_config(create_default_registry(), &engine_config, clock);
    let simulator = Simulator::new(&interpreter, engine_config.simulation_max_steps);

    let state = AppState::new(db_pool, app_config.clone());
    let app = build_router(state, flow_service, simulator);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
