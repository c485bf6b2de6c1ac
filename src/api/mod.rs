//! HTTP surface over the authentication core.

pub mod handlers;

use anyhow::Result;
use axum::{
    extract::Extension,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::auth::AuthCore;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the application router.
pub fn router(core: Arc<AuthCore>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/auth/login", post(handlers::login))
        .route("/v1/auth/refresh", post(handlers::refresh))
        .route("/v1/auth/logout", post(handlers::logout))
        .route("/v1/auth/sessions", get(handlers::list_sessions))
        .route("/v1/auth/sessions/:id", delete(handlers::revoke_session))
        .layer(Extension(core))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Bind and serve until the process is stopped.
pub async fn new(port: u16, core: Arc<AuthCore>) -> Result<()> {
    let listener = TcpListener::bind(format!("::0:{port}")).await?;
    info!(port, "listening");

    let app = router(core);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
