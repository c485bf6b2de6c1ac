use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::types::SessionResponse;
use super::{authorize, error_response};
use crate::auth::rate_limit::LimiterClass;
use crate::auth::AuthCore;

// axum handler listing the caller's active sessions
#[instrument(skip_all)]
pub async fn list_sessions(
    Extension(core): Extension<Arc<AuthCore>>,
    headers: HeaderMap,
) -> Response {
    let claims = match authorize(&core, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    // Authenticated endpoints key the limiter by subject, not IP.
    if let Err(err) = core.check_rate_limit(LimiterClass::General, &claims.sub.to_string()) {
        return error_response(&err);
    }

    match core.sessions().list_active(claims.sub).await {
        Ok(sessions) => {
            let sessions: Vec<SessionResponse> =
                sessions.into_iter().map(SessionResponse::from).collect();
            (StatusCode::OK, Json(sessions)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

// axum handler revoking one of the caller's sessions
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn revoke_session(
    Extension(core): Extension<Arc<AuthCore>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let claims = match authorize(&core, &headers).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    if let Err(err) = core.check_rate_limit(LimiterClass::General, &claims.sub.to_string()) {
        return error_response(&err);
    }

    // Ownership check: a caller can only revoke their own sessions.
    let owned = match core.sessions().list_active(claims.sub).await {
        Ok(sessions) => sessions.iter().any(|session| session.id == session_id),
        Err(err) => return error_response(&err),
    };
    if !owned {
        return (StatusCode::NOT_FOUND, "Session not found".to_string()).into_response();
    }

    match core.sessions().invalidate(session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}
