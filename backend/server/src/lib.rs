//! Documentation of a vehicle registration administration backend.
//!
//!
//!
//! # General Infrastructure
//!
//! - Admin frontend talks to this backend for vehicle creation
//! - Anyone can hit the public verification endpoint to check a code,
//!   so codes must stay valid forever once issued
//! - Backend talks to Redis on the same machine using internal names
//! - Ensure ports are exposed on the server machine since LAN not public
//!
//!
//!
//! # Registration Codes
//!
//! Every vehicle gets a `LSH-YY-PPNNNNNN` code at creation: 2-digit year,
//! 2 characters lifted from the plate, 6-digit sequence unique within the
//! year. See [`codes`] for the allocation scheme and [`database`] for the
//! Redis structures behind it.
//!
//!
//!
//! # Notes
//!
//! ## Why no per-request locking
//!
//! Allocation requests run independently, nothing in-process serializes
//! access to a year partition. Redis resolves ties: the counter increment
//! is atomic and the code write is first-wins. A racing loser gets a 409
//! and retries with a fresh sequence, so sequences can have gaps but never
//! duplicates.
//!
//! ## Degraded windows
//!
//! If Redis is unreachable the allocator falls back to timestamp-derived
//! sequences and logs at error level. Watch for those lines, they mark
//! windows where uniqueness rests on the final write alone.
use std::time::Duration;

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod codes;
pub mod config;
pub mod database;
pub mod error;
pub mod routes;
pub mod state;

use routes::{register_handler, verify_handler};
use state::AppState;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/vehicles", post(register_handler))
        .route("/verify/{code}", get(verify_handler))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
