use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::instrument;

use super::types::{RefreshRequest, TokenResponse};
use super::error_response;
use crate::auth::AuthCore;

// axum handler for refresh token rotation
#[instrument(skip_all)]
pub async fn refresh(
    Extension(core): Extension<Arc<AuthCore>>,
    payload: Option<Json<RefreshRequest>>,
) -> Response {
    let Some(Json(payload)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    match core.refresh(&payload.refresh_token).await {
        Ok(pair) => {
            let expires_in = core.settings().snapshot().security.access_token_ttl.as_secs();
            (StatusCode::OK, Json(TokenResponse::new(pair, expires_in))).into_response()
        }
        Err(err) => error_response(&err),
    }
}
