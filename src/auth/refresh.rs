//! Rotating refresh token store.
//!
//! Refresh tokens are opaque 256-bit random strings; only their SHA-256
//! hash ever touches storage. Each token is single-use: a successful
//! rotation revokes the presented token and persists exactly one
//! replacement in the same transaction, so a replayed token (stolen or
//! raced) loses deterministically.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::Instrument;
use uuid::Uuid;

use super::error::AuthError;
use crate::clock::Clock;

/// Generate a fresh opaque refresh token.
///
/// The raw value is only handed to the caller; storage keeps a hash.
pub(crate) fn generate_refresh_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a refresh token so raw values never touch the database.
pub(crate) fn hash_refresh_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Persistence seam for rotating refresh tokens.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Mint and persist a new token for `account_id`.
    async fn issue(&self, account_id: Uuid, ttl: Duration) -> Result<String, AuthError>;

    /// Validate a presented token and rotate it.
    ///
    /// Unknown and already-rotated tokens fail identically with
    /// [`AuthError::TokenInvalid`] so reuse detection never leaks whether
    /// the token ever existed. An expired token is revoked and reported as
    /// [`AuthError::TokenExpired`]; it is never revived by replay.
    async fn validate_and_rotate(
        &self,
        token: &str,
        ttl: Duration,
    ) -> Result<(String, Uuid), AuthError>;

    /// Revoke every live token for the account (logout, account deletion).
    async fn revoke_all(&self, account_id: Uuid) -> Result<(), AuthError>;

    /// Delete rows that are both expired and revoked; returns the count.
    async fn sweep_expired(&self) -> Result<u64, AuthError>;
}

#[derive(Debug)]
struct RefreshRow {
    account_id: Uuid,
    expires_at: SystemTime,
    revoked: bool,
}

/// In-process store over a single mutex; the lock is the transaction.
pub struct InMemoryRefreshTokenStore {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Vec<u8>, RefreshRow>>,
}

impl InMemoryRefreshTokenStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn insert_locked(
        rows: &mut HashMap<Vec<u8>, RefreshRow>,
        account_id: Uuid,
        expires_at: SystemTime,
    ) -> Result<String, AuthError> {
        let token = generate_refresh_token()?;
        rows.insert(
            hash_refresh_token(&token),
            RefreshRow {
                account_id,
                expires_at,
                revoked: false,
            },
        );
        Ok(token)
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn issue(&self, account_id: Uuid, ttl: Duration) -> Result<String, AuthError> {
        let expires_at = self.clock.now() + ttl;
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Self::insert_locked(&mut rows, account_id, expires_at)
    }

    async fn validate_and_rotate(
        &self,
        token: &str,
        ttl: Duration,
    ) -> Result<(String, Uuid), AuthError> {
        let now = self.clock.now();
        let hash = hash_refresh_token(token);
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(row) = rows.get_mut(&hash) else {
            return Err(AuthError::TokenInvalid);
        };
        if row.revoked {
            // Reuse of a rotated token: indistinguishable from unknown.
            return Err(AuthError::TokenInvalid);
        }
        if row.expires_at <= now {
            row.revoked = true;
            return Err(AuthError::TokenExpired);
        }

        row.revoked = true;
        let account_id = row.account_id;
        let replacement = Self::insert_locked(&mut rows, account_id, now + ttl)?;
        Ok((replacement, account_id))
    }

    async fn revoke_all(&self, account_id: Uuid) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        for row in rows.values_mut() {
            if row.account_id == account_id {
                row.revoked = true;
            }
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|_, row| !(row.revoked && row.expires_at <= now));
        Ok((before - rows.len()) as u64)
    }
}

/// Postgres-backed store; rotation is one transaction with a conditional
/// `UPDATE ... WHERE revoked = FALSE` as the compare-and-set.
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn issue(&self, account_id: Uuid, ttl: Duration) -> Result<String, AuthError> {
        let token = generate_refresh_token()?;
        let query = r"
            INSERT INTO refresh_tokens (token_hash, account_id, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash_refresh_token(&token))
            .bind(account_id)
            .bind(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert refresh token")?;
        Ok(token)
    }

    async fn validate_and_rotate(
        &self,
        token: &str,
        ttl: Duration,
    ) -> Result<(String, Uuid), AuthError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin refresh rotation transaction")?;

        // Row-level lock: only one concurrent caller flips revoked.
        let query = r"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE token_hash = $1
              AND revoked = FALSE
            RETURNING account_id, (expires_at <= NOW()) AS expired
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(hash_refresh_token(token))
            .fetch_optional(&mut *tx)
            .instrument(span)
            .await
            .context("failed to rotate refresh token")?;

        let Some(row) = row else {
            return Err(AuthError::TokenInvalid);
        };

        let account_id: Uuid = row.get("account_id");
        let expired: bool = row.get("expired");
        if expired {
            // Keep the revocation even though the rotation fails.
            tx.commit()
                .await
                .context("commit expired refresh token revocation")?;
            return Err(AuthError::TokenExpired);
        }

        let replacement = generate_refresh_token()?;
        let query = r"
            INSERT INTO refresh_tokens (token_hash, account_id, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash_refresh_token(&replacement))
            .bind(account_id)
            .bind(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert rotated refresh token")?;

        tx.commit().await.context("commit refresh rotation")?;
        Ok((replacement, account_id))
    }

    async fn revoke_all(&self, account_id: Uuid) -> Result<(), AuthError> {
        let query = "UPDATE refresh_tokens SET revoked = TRUE WHERE account_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(account_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke refresh tokens")?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let query = "DELETE FROM refresh_tokens WHERE revoked = TRUE AND expires_at <= NOW()";
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
            .context("failed to sweep refresh tokens")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::UNIX_EPOCH;

    fn store() -> (InMemoryRefreshTokenStore, ManualClock) {
        let clock = ManualClock::new(UNIX_EPOCH + Duration::from_secs(10_000));
        (InMemoryRefreshTokenStore::new(Arc::new(clock.clone())), clock)
    }

    const TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    #[tokio::test]
    async fn rotation_is_single_use() {
        let (store, _clock) = store();
        let account = Uuid::new_v4();
        let token = store.issue(account, TTL).await.expect("issue");

        let (replacement, owner) = store
            .validate_and_rotate(&token, TTL)
            .await
            .expect("first rotation");
        assert_eq!(owner, account);
        assert_ne!(replacement, token);

        // Replay of the rotated token is indistinguishable from unknown.
        let err = store.validate_and_rotate(&token, TTL).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));

        // The replacement still works.
        assert!(store.validate_and_rotate(&replacement, TTL).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let (store, _clock) = store();
        let err = store
            .validate_and_rotate("never-issued", TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));
    }

    #[tokio::test]
    async fn expired_token_fails_closed() {
        let (store, clock) = store();
        let account = Uuid::new_v4();
        let token = store.issue(account, Duration::from_secs(60)).await.expect("issue");

        clock.advance(Duration::from_secs(61));
        let err = store.validate_and_rotate(&token, TTL).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));

        // Replay after expiry revocation reports invalid, not expired.
        let err = store.validate_and_rotate(&token, TTL).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));
    }

    #[tokio::test]
    async fn concurrent_rotation_has_exactly_one_winner() {
        let (store, _clock) = store();
        let store = Arc::new(store);
        let token = store.issue(Uuid::new_v4(), TTL).await.expect("issue");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                store.validate_and_rotate(&token, TTL).await.is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn revoke_all_kills_every_token_for_account() {
        let (store, _clock) = store();
        let account = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mine = store.issue(account, TTL).await.expect("issue");
        let theirs = store.issue(other, TTL).await.expect("issue");

        store.revoke_all(account).await.expect("revoke");

        let err = store.validate_and_rotate(&mine, TTL).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenInvalid));
        assert!(store.validate_and_rotate(&theirs, TTL).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_only_revoked_and_expired() {
        let (store, clock) = store();
        let account = Uuid::new_v4();

        let short = store.issue(account, Duration::from_secs(10)).await.expect("issue");
        let _live = store.issue(account, TTL).await.expect("issue");

        clock.advance(Duration::from_secs(11));
        // Expired but not yet revoked: the sweep leaves it for rotation to
        // fail closed first.
        assert_eq!(store.sweep_expired().await.expect("sweep"), 0);

        let _ = store.validate_and_rotate(&short, TTL).await;
        assert_eq!(store.sweep_expired().await.expect("sweep"), 1);
    }

    #[test]
    fn raw_tokens_have_enough_entropy() {
        let token = generate_refresh_token().expect("token");
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .expect("base64");
        assert_eq!(decoded.len(), 32);
        assert_ne!(hash_refresh_token(&token), hash_refresh_token("other"));
    }
}
