use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elara_db::{JobStore, MemoryStore, PgStore};
use elara_events::LiveBus;
use elara_server::config::ServerConfig;
use elara_server::service::Orchestrator;
use elara_server::state::AppState;
use elara_server::{background, routes};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "elara_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = config.port, "Loaded server configuration");

    // Postgres when DATABASE_URL is set, the in-memory store otherwise.
    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = elara_db::create_pool(&url)
                .await
                .expect("Failed to connect to database");
            elara_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Using PostgreSQL job store");
            Arc::new(PgStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, jobs will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let bus = Arc::new(LiveBus::new());
    let orchestrator = Arc::new(Orchestrator::new(store, Arc::clone(&bus)));
    let config = Arc::new(config);

    let sweep_cancel = CancellationToken::new();
    let sweep_handle = tokio::spawn(background::run_sweep(
        Arc::clone(&orchestrator),
        Arc::clone(&config),
        sweep_cancel.clone(),
    ));

    let state = AppState {
        orchestrator,
        bus,
        config: Arc::clone(&config),
    };

    let app = Router::new()
        .merge(routes::root_routes())
        .nest("/api/v1", routes::api_routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    sweep_cancel.cancel();
    let _ = sweep_handle.await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM so the server shuts down cleanly whether
/// stopped interactively or by a process manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
