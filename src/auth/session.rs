//! Session registry with inactivity-based expiry.
//!
//! A session expires `timeout` after its last activity, not after login;
//! refreshing a session slides the expiry forward. Logout marks sessions
//! inactive rather than deleting them, keeping the row around as login
//! history until its expiry passes and the sweep reaps it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::Instrument;
use uuid::Uuid;

use super::error::AuthError;
use crate::clock::{from_unix_seconds, Clock};

/// One tracked login session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: SystemTime,
    pub last_activity: SystemTime,
    pub expires_at: SystemTime,
    pub active: bool,
}

/// Persistence seam for login sessions.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn create(
        &self,
        account_id: Uuid,
        ip: Option<&str>,
        user_agent: Option<&str>,
        timeout: Duration,
    ) -> Result<SessionRecord, AuthError>;

    /// Slide the expiry window forward. Fails with
    /// [`AuthError::SessionInvalid`] for unknown, inactive, or expired
    /// sessions.
    async fn refresh(&self, id: Uuid, timeout: Duration) -> Result<SessionRecord, AuthError>;

    /// Mark one session inactive; idempotent.
    async fn invalidate(&self, id: Uuid) -> Result<(), AuthError>;

    /// Mark every session of an account inactive; returns the count.
    async fn invalidate_all(&self, account_id: Uuid) -> Result<u64, AuthError>;

    /// Remove every session of an account outright; returns the count.
    async fn delete_all(&self, account_id: Uuid) -> Result<u64, AuthError>;

    /// Sessions that are active and not yet expired.
    async fn list_active(&self, account_id: Uuid) -> Result<Vec<SessionRecord>, AuthError>;

    /// Remove sessions past expiry, active or not; returns the count.
    async fn sweep_expired(&self) -> Result<u64, AuthError>;
}

/// In-process session registry.
#[derive(Debug)]
pub struct InMemorySessionRegistry {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Uuid, SessionRecord>>,
}

impl InMemorySessionRegistry {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn create(
        &self,
        account_id: Uuid,
        ip: Option<&str>,
        user_agent: Option<&str>,
        timeout: Duration,
    ) -> Result<SessionRecord, AuthError> {
        let now = self.clock.now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            account_id,
            ip: ip.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            login_at: now,
            last_activity: now,
            expires_at: now + timeout,
            active: true,
        };
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn refresh(&self, id: Uuid, timeout: Duration) -> Result<SessionRecord, AuthError> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let row = rows.get_mut(&id).ok_or(AuthError::SessionInvalid)?;
        if !row.active || row.expires_at <= now {
            return Err(AuthError::SessionInvalid);
        }
        row.last_activity = now;
        row.expires_at = now + timeout;
        Ok(row.clone())
    }

    async fn invalidate(&self, id: Uuid) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(row) = rows.get_mut(&id) {
            row.active = false;
        }
        Ok(())
    }

    async fn invalidate_all(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for row in rows.values_mut() {
            if row.account_id == account_id && row.active {
                row.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_all(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| row.account_id != account_id);
        Ok((before - rows.len()) as u64)
    }

    async fn list_active(&self, account_id: Uuid) -> Result<Vec<SessionRecord>, AuthError> {
        let now = self.clock.now();
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<SessionRecord> = rows
            .values()
            .filter(|row| row.account_id == account_id && row.active && row.expires_at > now)
            .cloned()
            .collect();
        sessions.sort_by_key(|row| row.login_at);
        Ok(sessions)
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| row.expires_at > now);
        Ok((before - rows.len()) as u64)
    }
}

/// Postgres-backed session registry.
pub struct PgSessionRegistry {
    pool: PgPool,
}

impl PgSessionRegistry {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str = r"
    id, account_id, ip, user_agent, active,
    EXTRACT(EPOCH FROM login_at)::BIGINT AS login_at_epoch,
    EXTRACT(EPOCH FROM last_activity)::BIGINT AS last_activity_epoch,
    EXTRACT(EPOCH FROM expires_at)::BIGINT AS expires_at_epoch
";

fn row_to_session(row: &PgRow) -> Result<SessionRecord, AuthError> {
    let login_at: i64 = row.try_get("login_at_epoch").context("read login_at")?;
    let last_activity: i64 = row
        .try_get("last_activity_epoch")
        .context("read last_activity")?;
    let expires_at: i64 = row.try_get("expires_at_epoch").context("read expires_at")?;
    Ok(SessionRecord {
        id: row.try_get("id").context("read id column")?,
        account_id: row.try_get("account_id").context("read account_id column")?,
        ip: row.try_get("ip").context("read ip column")?,
        user_agent: row.try_get("user_agent").context("read user_agent column")?,
        login_at: from_unix_seconds(login_at),
        last_activity: from_unix_seconds(last_activity),
        expires_at: from_unix_seconds(expires_at),
        active: row.try_get("active").context("read active column")?,
    })
}

#[async_trait]
impl SessionRegistry for PgSessionRegistry {
    async fn create(
        &self,
        account_id: Uuid,
        ip: Option<&str>,
        user_agent: Option<&str>,
        timeout: Duration,
    ) -> Result<SessionRecord, AuthError> {
        let query = format!(
            r"
            INSERT INTO sessions (id, account_id, ip, user_agent, login_at,
                last_activity, expires_at, active)
            VALUES ($1, $2, $3, $4, NOW(), NOW(),
                NOW() + ($5 * INTERVAL '1 second'), TRUE)
            RETURNING {SESSION_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind(ip)
            .bind(user_agent)
            .bind(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX))
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to create session")?;
        row_to_session(&row)
    }

    async fn refresh(&self, id: Uuid, timeout: Duration) -> Result<SessionRecord, AuthError> {
        let query = format!(
            r"
            UPDATE sessions
            SET last_activity = NOW(),
                expires_at = NOW() + ($2 * INTERVAL '1 second')
            WHERE id = $1 AND active = TRUE AND expires_at > NOW()
            RETURNING {SESSION_COLUMNS}
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to refresh session")?
            .ok_or(AuthError::SessionInvalid)?;
        row_to_session(&row)
    }

    async fn invalidate(&self, id: Uuid) -> Result<(), AuthError> {
        let query = "UPDATE sessions SET active = FALSE WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to invalidate session")?;
        Ok(())
    }

    async fn invalidate_all(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let query = r"
            UPDATE sessions SET active = FALSE
            WHERE account_id = $1 AND active = TRUE
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(account_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to invalidate sessions")?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self, account_id: Uuid) -> Result<u64, AuthError> {
        let query = "DELETE FROM sessions WHERE account_id = $1";
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
            .context("failed to delete sessions")?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self, account_id: Uuid) -> Result<Vec<SessionRecord>, AuthError> {
        let query = format!(
            r"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE account_id = $1 AND active = TRUE AND expires_at > NOW()
            ORDER BY login_at
            "
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list sessions")?;
        rows.iter().map(row_to_session).collect()
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let query = "DELETE FROM sessions WHERE expires_at <= NOW()";
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
            .context("failed to sweep sessions")?;
        Ok(result.rows_affected())
    }
}
