//! Request and response bodies for the auth endpoints.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::session::SessionRecord;
use crate::auth::TokenPair;
use crate::clock::unix_seconds;

#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

impl TokenResponse {
    #[must_use]
    pub fn new(pair: TokenPair, expires_in: u64) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer",
            expires_in,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct SessionResponse {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub login_at: i64,
    pub last_activity: i64,
    pub expires_at: i64,
}

impl From<SessionRecord> for SessionResponse {
    fn from(session: SessionRecord) -> Self {
        Self {
            id: session.id,
            ip: session.ip,
            user_agent: session.user_agent,
            login_at: unix_seconds(session.login_at),
            last_activity: unix_seconds(session.last_activity),
            expires_at: unix_seconds(session.expires_at),
        }
    }
}
