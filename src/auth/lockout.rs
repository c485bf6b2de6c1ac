//! Account lookup and failed-login lockout tracking.
//!
//! The failure counter and lock expiry live with the account row. The
//! counter bump and the lock decision happen in one statement so two
//! concurrent failed logins cannot each observe a pre-lock count.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{warn, Instrument};
use uuid::Uuid;

use super::collaborators::{AuditSink, NotificationSender};
use super::error::AuthError;
use super::token::Role;
use crate::clock::{from_unix_seconds, Clock};

/// An account as the authentication core sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: Uuid,
    pub email: String,
    pub roles: Vec<Role>,
    pub failed_attempts: u32,
    pub locked_until: Option<SystemTime>,
}

/// Result of recording one failed login attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: u32,
    /// Set when this attempt tripped the lockout threshold.
    pub locked_until: Option<SystemTime>,
}

/// Persistence seam for accounts and their lockout state.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>, AuthError>;

    /// Increment the failure counter, locking the account atomically once
    /// the counter reaches `max_attempts`.
    async fn record_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
        lockout: Duration,
    ) -> Result<FailureOutcome, AuthError>;

    /// Reset the counter and clear any lock after a successful login.
    async fn record_success(&self, id: Uuid) -> Result<(), AuthError>;

    /// Administrative unlock; also resets the counter.
    async fn unlock(&self, id: Uuid) -> Result<(), AuthError>;
}

/// In-process account store, seeded by tests.
#[derive(Debug)]
pub struct InMemoryAccountStore {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Uuid, AccountRecord>>,
}

impl InMemoryAccountStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Seed an unlocked account and return its id.
    pub fn add_account(&self, email: &str, roles: &[Role]) -> Uuid {
        let id = Uuid::new_v4();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.insert(
            id,
            AccountRecord {
                id,
                email: email.to_string(),
                roles: roles.to_vec(),
                failed_attempts: 0,
                locked_until: None,
            },
        );
        id
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().find(|row| row.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>, AuthError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(&id).cloned())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
        lockout: Duration,
    ) -> Result<FailureOutcome, AuthError> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("failure recorded for unknown account {id}"))?;

        row.failed_attempts += 1;
        if row.failed_attempts >= max_attempts {
            row.locked_until = Some(now + lockout);
        }
        Ok(FailureOutcome {
            attempts: row.failed_attempts,
            locked_until: row.locked_until,
        })
    }

    async fn record_success(&self, id: Uuid) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("success recorded for unknown account {id}"))?;
        row.failed_attempts = 0;
        row.locked_until = None;
        Ok(())
    }

    async fn unlock(&self, id: Uuid) -> Result<(), AuthError> {
        self.record_success(id).await
    }
}

/// Postgres-backed account store.
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn reset_lockout(&self, id: Uuid) -> Result<(), AuthError> {
        let query = r"
            UPDATE accounts
            SET failed_attempts = 0, locked_until = NULL
            WHERE id = $1
        ";
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
            .context("failed to reset lockout state")?;
        Ok(())
    }
}

fn row_to_account(row: &PgRow) -> Result<AccountRecord, AuthError> {
    let roles: Vec<String> = row.try_get("roles").context("read roles column")?;
    let roles = roles
        .iter()
        .map(|role| {
            Role::from_str(role).map_err(|_| anyhow!("unknown role {role} on account row"))
        })
        .collect::<Result<Vec<Role>>>()?;

    let failed_attempts: i32 = row
        .try_get("failed_attempts")
        .context("read failed_attempts column")?;
    let locked_until: Option<i64> = row
        .try_get("locked_until_epoch")
        .context("read locked_until column")?;

    Ok(AccountRecord {
        id: row.try_get("id").context("read id column")?,
        email: row.try_get("email").context("read email column")?,
        roles,
        failed_attempts: u32::try_from(failed_attempts).unwrap_or(0),
        locked_until: locked_until.map(from_unix_seconds),
    })
}

const SELECT_ACCOUNT: &str = r"
    SELECT id, email, roles, failed_attempts,
        EXTRACT(EPOCH FROM locked_until)::BIGINT AS locked_until_epoch
    FROM accounts
";

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError> {
        let query = format!("{SELECT_ACCOUNT} WHERE email = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up account by email")?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>, AuthError> {
        let query = format!("{SELECT_ACCOUNT} WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up account by id")?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn record_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
        lockout: Duration,
    ) -> Result<FailureOutcome, AuthError> {
        // Counter bump and lock decision in a single statement.
        let query = r"
            UPDATE accounts
            SET failed_attempts = failed_attempts + 1,
                locked_until = CASE
                    WHEN failed_attempts + 1 >= $2
                    THEN NOW() + ($3 * INTERVAL '1 second')
                    ELSE locked_until
                END
            WHERE id = $1
            RETURNING failed_attempts,
                EXTRACT(EPOCH FROM locked_until)::BIGINT AS locked_until_epoch
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .bind(i64::from(max_attempts))
            .bind(i64::try_from(lockout.as_secs()).unwrap_or(i64::MAX))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login failure")?
            .ok_or_else(|| anyhow!("failure recorded for unknown account {id}"))?;

        let attempts: i32 = row
            .try_get("failed_attempts")
            .context("read failed_attempts column")?;
        let locked_until: Option<i64> = row
            .try_get("locked_until_epoch")
            .context("read locked_until column")?;
        Ok(FailureOutcome {
            attempts: u32::try_from(attempts).unwrap_or(0),
            locked_until: locked_until.map(from_unix_seconds),
        })
    }

    async fn record_success(&self, id: Uuid) -> Result<(), AuthError> {
        self.reset_lockout(id).await
    }

    async fn unlock(&self, id: Uuid) -> Result<(), AuthError> {
        self.reset_lockout(id).await
    }
}

/// Lockout policy wrapped around an [`AccountStore`].
///
/// Owns the side effects: lock notifications and audit records. Both are
/// best effort; a failing mail relay must never turn a correctly handled
/// login failure into a 500.
pub struct AccountSecurity {
    store: Arc<dyn AccountStore>,
    notifier: Arc<dyn NotificationSender>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl AccountSecurity {
    #[must_use]
    pub fn new(
        store: Arc<dyn AccountStore>,
        notifier: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            audit,
            clock,
        }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>, AuthError> {
        self.store.find_by_email(email).await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<AccountRecord>, AuthError> {
        self.store.find_by_id(id).await
    }

    /// A lock is only effective until its expiry; past that the account
    /// behaves as unlocked without waiting for a reset.
    #[must_use]
    pub fn is_locked(&self, account: &AccountRecord) -> bool {
        account
            .locked_until
            .is_some_and(|until| until > self.clock.now())
    }

    /// Record a failed attempt and fire the lock side effects when this
    /// attempt crossed the threshold.
    pub async fn record_failure(
        &self,
        account: &AccountRecord,
        max_attempts: u32,
        lockout: Duration,
    ) -> Result<FailureOutcome, AuthError> {
        let outcome = self
            .store
            .record_failure(account.id, max_attempts, lockout)
            .await?;

        if outcome.attempts >= max_attempts {
            let minutes = lockout.as_secs() / 60;
            if let Err(err) = self
                .notifier
                .notify_account_locked(&account.email, minutes)
                .await
            {
                warn!(account_id = %account.id, "account-locked notification failed: {err:#}");
            }
            if let Err(err) = self
                .audit
                .record_event(Some(account.id), "ACCOUNT_LOCKED", false)
                .await
            {
                warn!(account_id = %account.id, "audit write failed: {err:#}");
            }
        }
        Ok(outcome)
    }

    pub async fn record_success(&self, id: Uuid) -> Result<(), AuthError> {
        self.store.record_success(id).await
    }

    pub async fn unlock(&self, id: Uuid) -> Result<(), AuthError> {
        self.store.unlock(id).await?;
        if let Err(err) = self
            .audit
            .record_event(Some(id), "ACCOUNT_UNLOCKED", true)
            .await
        {
            warn!(account_id = %id, "audit write failed: {err:#}");
        }
        Ok(())
    }
}
