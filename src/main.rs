//! WebRTC session bridge
//!
//! Terminates browser peers over WebRTC data channels behind a single
//! signaling WebSocket, and adapts each one to an upstream game-server
//! session through the [`host::HostFacade`] abstraction. The binary wires
//! together the dispatcher, socket and host facade into a [`Context`],
//! then serves the signaling listener plus a small health/stats HTTP
//! surface with `axum`.

mod channel;
mod codec;
mod config;
mod context;
mod error;
mod handler;
mod host;
mod pool;
mod reference;
mod rtt;
mod session;
mod signaling;
mod socket;
mod task;
mod webrtc_facade;

use std::net::SocketAddr;

use axum::{extract::State, http::Method, response::IntoResponse, routing::get, Json, Router};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::{Args, Config};
use context::Context;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webrtc_session_bridge=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from(&args);

    let context = Context::new(config).expect("failed to build bridge context");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(handler::ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(context.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!(%addr, "webrtc session bridge starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    let shutdown_context = context.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_context.shutdown();
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .expect("server error");
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "webrtc-session-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint: live session count and dispatcher liveness.
async fn stats_handler(State(context): State<std::sync::Arc<Context>>) -> impl IntoResponse {
    Json(json!({
        "active_sessions": context.socket.session_count(),
        "dispatcher_running": context.dispatcher.is_running(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_constants() {
        let config = Config::default();
        assert_eq!(config.channel_count, 2);
        assert_eq!(config.auth_timeout_ms, 5000);
    }

    #[test]
    fn health_json_structure() {
        let json_val = json!({
            "status": "ok",
            "service": "webrtc-session-bridge",
            "version": env!("CARGO_PKG_VERSION"),
        });
        assert_eq!(json_val["status"], "ok");
        assert_eq!(json_val["service"], "webrtc-session-bridge");
    }
}
