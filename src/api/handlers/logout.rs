use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::instrument;

use super::{bearer_token, error_response};
use crate::auth::{AuthCore, AuthError};

// axum handler for logout
#[instrument(skip_all)]
pub async fn logout(Extension(core): Extension<Arc<AuthCore>>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(&AuthError::TokenInvalid);
    };

    match core.logout(token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}
