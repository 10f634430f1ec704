use std::sync::Arc;

use anyhow::Result;
use axum::{http::StatusCode, middleware, response::IntoResponse, routing::get, Json, Router};
use channelgate_xmpp::{Connector, Gateway};
use serde_json::json;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

mod error;
mod routes;
mod session;
#[cfg(test)]
mod testing;

/// Serve the gateway on `listen` until Ctrl-C.
pub async fn start<C: Connector>(gateway: Arc<Gateway<C>>, listen: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "Bound HTTP listener");

    let app = create_router(gateway);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("HTTP server received shutdown signal, draining connections");
}

/// Create the Axum router with all routes and middleware
fn create_router<C: Connector>(gateway: Arc<Gateway<C>>) -> Router {
    let api = Router::new()
        .route("/api/v1/discover/:domain", get(routes::discover::<C>))
        .route(
            "/api/v1/channels/:channel/:node/updates",
            get(routes::updates::<C>),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&gateway),
            session::require_session::<C>,
        ))
        .with_state(gateway);

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "channelgate-server",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
