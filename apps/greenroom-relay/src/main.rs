mod cli;
mod config;
mod handlers;
mod storage;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{
        create_session, delete_session, get_session, health_check, join_session, revoke_invite,
        AppContext, SharedStorage,
    },
    storage::Storage,
    websocket::{websocket_handler, SignalingState},
};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Probe { url }) => {
            if let Err(e) = cli::run_probe(url).await {
                error!("probe failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Invite {
            url,
            candidate,
            title,
        }) => {
            if let Err(e) = cli::run_invite(url, candidate, title).await {
                error!("invite failed: {}", e);
                std::process::exit(1);
            }
        }
        None => run_server().await,
    }
}

async fn run_server() {
    let config = Arc::new(Config::from_env());
    info!("Starting Greenroom relay on port {}", config.port);
    info!("Redis URL: {}", config.redis_url);
    info!("Session TTL: {} seconds", config.session_ttl_seconds);

    let storage = match Storage::new(&config.redis_url, config.session_ttl_seconds).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };
    let shared_storage: SharedStorage = Arc::new(storage);

    let signaling_state = SignalingState::new(
        shared_storage.clone(),
        Duration::from_secs(config.heartbeat_timeout_seconds),
    );

    let context = AppContext {
        storage: shared_storage,
        config: config.clone(),
    };

    // Two routers with different states, merged.
    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/join", post(join_session))
        .route("/sessions/:id/revoke", post(revoke_invite))
        .with_state(context);

    let ws_routes = Router::new()
        .route("/ws/:session_id/:role", get(websocket_handler))
        .with_state(signaling_state);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Greenroom relay listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
