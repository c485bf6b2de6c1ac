//! Denylist for access tokens revoked before their natural expiry.
//!
//! Access tokens are stateless, so logout cannot invalidate one by itself;
//! instead its `jti` lands here and every authenticated request checks the
//! list after signature verification. Entries only need to live until the
//! token's own expiry, after which the signer rejects it anyway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tracing::Instrument;
use uuid::Uuid;

use super::error::AuthError;
use crate::clock::{unix_seconds, Clock};

/// Persistence seam for revoked access token identifiers.
#[async_trait]
pub trait TokenDenylist: Send + Sync {
    /// Record a revoked token; idempotent.
    async fn add(
        &self,
        token_id: Uuid,
        account_id: Option<Uuid>,
        expires_at: SystemTime,
    ) -> Result<(), AuthError>;

    async fn contains(&self, token_id: Uuid) -> Result<bool, AuthError>;

    /// Drop entries past their mirrored expiry; returns the count.
    async fn sweep_expired(&self) -> Result<u64, AuthError>;

    /// Drop every entry owned by an account (account deletion cascade).
    async fn purge_account(&self, account_id: Uuid) -> Result<u64, AuthError>;
}

#[derive(Debug)]
struct DenyRow {
    account_id: Option<Uuid>,
    expires_at: SystemTime,
}

/// In-process denylist.
pub struct InMemoryTokenDenylist {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Uuid, DenyRow>>,
}

impl InMemoryTokenDenylist {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TokenDenylist for InMemoryTokenDenylist {
    async fn add(
        &self,
        token_id: Uuid,
        account_id: Option<Uuid>,
        expires_at: SystemTime,
    ) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.insert(
            token_id,
            DenyRow {
                account_id,
                expires_at,
            },
        );
        Ok(())
    }

    async fn contains(&self, token_id: Uuid) -> Result<bool, AuthError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.contains_key(&token_id))
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| row.expires_at > now);
        Ok((before - rows.len()) as u64)
    }

    async fn purge_account(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| row.account_id != Some(account_id));
        Ok((before - rows.len()) as u64)
    }
}

/// Postgres-backed denylist.
pub struct PgTokenDenylist {
    pool: PgPool,
}

impl PgTokenDenylist {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenDenylist for PgTokenDenylist {
    async fn add(
        &self,
        token_id: Uuid,
        account_id: Option<Uuid>,
        expires_at: SystemTime,
    ) -> Result<(), AuthError> {
        // Double logout must not fail, hence the conflict clause.
        let query = r"
            INSERT INTO token_denylist (token_id, account_id, expires_at)
            VALUES ($1, $2, to_timestamp($3::double precision))
            ON CONFLICT (token_id) DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_id)
            .bind(account_id)
            .bind(unix_seconds(expires_at))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert denylist entry")?;
        Ok(())
    }

    async fn contains(&self, token_id: Uuid) -> Result<bool, AuthError> {
        let query = "SELECT 1 AS hit FROM token_denylist WHERE token_id = $1 LIMIT 1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to check denylist")?;
        Ok(row.is_some())
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let query = "DELETE FROM token_denylist WHERE expires_at <= NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep denylist")?;
        Ok(result.rows_affected())
    }

    async fn purge_account(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let query = "DELETE FROM token_denylist WHERE account_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(account_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge denylist entries")?;
        Ok(result.rows_affected())
    }
}
