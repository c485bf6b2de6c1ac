//! Outward-facing seams the core depends on but does not implement.
//!
//! Password verification, notification delivery, and audit recording all
//! live behind traits so deployments can wire real backends while tests
//! and early bring-up use the no-op variants.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, Instrument};
use uuid::Uuid;

use super::error::AuthError;

/// Checks a raw password against stored credentials.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(false)` means wrong password; errors mean the check itself
    /// could not run.
    async fn check_password(&self, email: &str, password: &str) -> Result<bool, AuthError>;
}

/// Delivers security notifications to account owners.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify_account_locked(&self, email: &str, lockout_minutes: u64) -> Result<()>;

    async fn notify_login(&self, email: &str, success: bool) -> Result<()>;
}

/// Records security-relevant events for later review.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_event(
        &self,
        account_id: Option<Uuid>,
        event: &str,
        success: bool,
    ) -> Result<()>;
}

/// Credential check against the accounts table.
///
/// Hashing stays in Postgres via pgcrypto's `crypt`, so the stored hash
/// format is owned by the database and no password material is compared
/// in process memory.
pub struct PgCredentialVerifier {
    pool: PgPool,
}

impl PgCredentialVerifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for PgCredentialVerifier {
    async fn check_password(&self, email: &str, password: &str) -> Result<bool, AuthError> {
        let query = r"
            SELECT (password_hash = crypt($2, password_hash)) AS matched
            FROM accounts
            WHERE email = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .bind(password)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to verify credentials")?;

        match row {
            Some(row) => {
                let matched: Option<bool> =
                    row.try_get("matched").context("read matched column")?;
                Ok(matched.unwrap_or(false))
            }
            None => Ok(false),
        }
    }
}

/// Notification sender that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationSender for NoopNotifier {
    async fn notify_account_locked(&self, email: &str, lockout_minutes: u64) -> Result<()> {
        debug!(email, lockout_minutes, "skipping account-locked notification");
        Ok(())
    }

    async fn notify_login(&self, email: &str, success: bool) -> Result<()> {
        debug!(email, success, "skipping login notification");
        Ok(())
    }
}

/// Audit sink that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn record_event(
        &self,
        account_id: Option<Uuid>,
        event: &str,
        success: bool,
    ) -> Result<()> {
        debug!(?account_id, event, success, "audit event");
        Ok(())
    }
}
