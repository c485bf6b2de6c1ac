pub mod health;
pub use self::health::health;

pub mod login;
pub use self::login::login;

pub mod refresh;
pub use self::refresh::refresh;

pub mod logout;
pub use self::logout::logout;

pub mod sessions;
pub use self::sessions::{list_sessions, revoke_session};

pub mod types;

// common functions for the handlers
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use regex::Regex;
use serde_json::json;
use std::net::SocketAddr;
use tracing::error;

use crate::auth::token::AccessClaims;
use crate::auth::{AuthCore, AuthError};

pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").map_or(false, |re| re.is_match(email.trim()))
}

/// Client address for rate limiting: forwarded-for chain first, then the
/// real-ip header, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return Some(real_ip.to_string());
        }
    }

    peer.map(|addr| addr.ip().to_string())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Authenticate the bearer token or produce the error response.
pub(crate) async fn authorize(
    core: &AuthCore,
    headers: &HeaderMap,
) -> Result<AccessClaims, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error_response(&AuthError::TokenInvalid));
    };
    core.authenticate(token)
        .await
        .map_err(|err| error_response(&err))
}

/// Map a core failure onto a response.
///
/// Credential, lockout, and token failures share one low-detail message so
/// responses cannot be used to enumerate accounts or probe token state.
pub fn error_response(err: &AuthError) -> Response {
    match err {
        AuthError::RateLimitExceeded { retry_after } => {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            let mut headers = HeaderMap::new();
            if let Ok(value) = secs.to_string().parse() {
                headers.insert(header::RETRY_AFTER, value);
            }
            if let Ok(value) = "0".parse() {
                headers.insert("X-RateLimit-Remaining", value);
            }
            (
                StatusCode::TOO_MANY_REQUESTS,
                headers,
                Json(json!({"error": "too many requests"})),
            )
                .into_response()
        }
        AuthError::InvalidCredentials
        | AuthError::AccountLocked
        | AuthError::TokenExpired
        | AuthError::TokenInvalid
        | AuthError::TokenRevoked => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed"})),
        )
            .into_response(),
        AuthError::SessionInvalid => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid session"})),
        )
            .into_response(),
        AuthError::Internal(err) => {
            error!("internal error: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}
