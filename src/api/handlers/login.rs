use axum::{
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::instrument;

use super::types::{LoginRequest, TokenResponse};
use super::{client_ip, error_response, user_agent, valid_email};
use crate::auth::AuthCore;

// axum handler for login
#[instrument(skip_all)]
pub async fn login(
    Extension(core): Extension<Arc<AuthCore>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Option<Json<LoginRequest>>,
) -> Response {
    let Some(Json(payload)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    if !valid_email(&payload.email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }

    let ip = client_ip(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let user_agent = user_agent(&headers);

    match core
        .login(
            &payload.email,
            &payload.password,
            ip.as_deref(),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(grant) => {
            let expires_in = core.settings().snapshot().security.access_token_ttl.as_secs();
            (
                StatusCode::OK,
                Json(TokenResponse::new(grant.tokens, expires_in)),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}
