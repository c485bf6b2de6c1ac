//! Authentication orchestrator composing the token, lockout, session, and
//! rate limiting pieces into the login, refresh, and logout flows.
//!
//! A login walks the components in a fixed order: rate limiter first so
//! abusive sources are rejected before any storage is touched, then the
//! credential check, then the lockout check, and only then token issuance
//! and session creation. Notification and audit side effects are best
//! effort throughout; the primary flow never fails because of them.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::collaborators::{AuditSink, CredentialVerifier, NotificationSender};
use super::denylist::TokenDenylist;
use super::error::AuthError;
use super::lockout::AccountSecurity;
use super::rate_limit::{LimiterClass, RateLimiter, RateProbe};
use super::refresh::RefreshTokenStore;
use super::session::{SessionRecord, SessionRegistry};
use super::token::{AccessClaims, TokenSigner};
use crate::config::SettingsHandle;

/// Access and refresh token pair handed to a caller on login or refresh.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Everything a successful login produces.
#[derive(Clone, Debug)]
pub struct LoginGrant {
    pub tokens: TokenPair,
    pub session: SessionRecord,
}

/// Composition root for the authentication core.
pub struct AuthCore {
    signer: TokenSigner,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    denylist: Arc<dyn TokenDenylist>,
    sessions: Arc<dyn SessionRegistry>,
    security: AccountSecurity,
    limiter: RateLimiter,
    credentials: Arc<dyn CredentialVerifier>,
    notifier: Arc<dyn NotificationSender>,
    audit: Arc<dyn AuditSink>,
    settings: SettingsHandle,
}

/// Lowercase and trim an email so lookups and limiter keys are stable.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl AuthCore {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        signer: TokenSigner,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        denylist: Arc<dyn TokenDenylist>,
        sessions: Arc<dyn SessionRegistry>,
        security: AccountSecurity,
        limiter: RateLimiter,
        credentials: Arc<dyn CredentialVerifier>,
        notifier: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditSink>,
        settings: SettingsHandle,
    ) -> Self {
        Self {
            signer,
            refresh_tokens,
            denylist,
            sessions,
            security,
            limiter,
            credentials,
            notifier,
            audit,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionRegistry> {
        &self.sessions
    }

    /// Authenticate credentials and open a session.
    ///
    /// `ip` keys the login rate limiter and is recorded on the session;
    /// callers without one fall into a shared bucket.
    ///
    /// # Errors
    /// `RateLimitExceeded`, `InvalidCredentials`, `AccountLocked`, or
    /// `Internal` from storage.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<LoginGrant, AuthError> {
        let settings = self.settings.snapshot();
        self.enforce_rate_limit(LimiterClass::Login, ip.unwrap_or("unknown"))?;

        let email = normalize_email(email);
        let Some(account) = self.security.find_by_email(&email).await? else {
            // Unknown accounts fail exactly like a wrong password.
            self.audit(None, "LOGIN_FAILURE", false).await;
            return Err(AuthError::InvalidCredentials);
        };

        if !self.credentials.check_password(&email, password).await? {
            let outcome = self
                .security
                .record_failure(
                    &account,
                    settings.security.max_failed_attempts,
                    settings.security.lockout_duration,
                )
                .await?;
            info!(
                account_id = %account.id,
                attempts = outcome.attempts,
                "login failed"
            );
            self.audit(Some(account.id), "LOGIN_FAILURE", false).await;
            self.notify_login(&email, false).await;
            return Err(AuthError::InvalidCredentials);
        }

        if self.security.is_locked(&account) {
            self.audit(Some(account.id), "LOGIN_BLOCKED", false).await;
            return Err(AuthError::AccountLocked);
        }

        self.security.record_success(account.id).await?;

        let access_token = self.signer.issue(
            account.id,
            &account.roles,
            settings.security.access_token_ttl,
        )?;
        let refresh_token = self
            .refresh_tokens
            .issue(account.id, settings.security.refresh_token_ttl)
            .await?;
        let session = self
            .sessions
            .create(account.id, ip, user_agent, settings.security.session_timeout)
            .await?;

        info!(account_id = %account.id, session_id = %session.id, "login succeeded");
        self.audit(Some(account.id), "LOGIN_SUCCESS", true).await;
        self.notify_login(&email, true).await;

        Ok(LoginGrant {
            tokens: TokenPair {
                access_token,
                refresh_token,
            },
            session,
        })
    }

    /// Rotate a refresh token and mint a fresh access token.
    ///
    /// # Errors
    /// `TokenInvalid` for unknown or already-rotated tokens, `TokenExpired`
    /// past the refresh TTL, or `Internal` from storage.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let settings = self.settings.snapshot();
        let (replacement, account_id) = self
            .refresh_tokens
            .validate_and_rotate(refresh_token, settings.security.refresh_token_ttl)
            .await?;

        // The account may have been deleted since the token was issued.
        let account = self
            .security
            .find_by_id(account_id)
            .await?
            .ok_or(AuthError::TokenInvalid)?;

        let access_token = self.signer.issue(
            account.id,
            &account.roles,
            settings.security.access_token_ttl,
        )?;

        self.audit(Some(account.id), "TOKEN_REFRESH", true).await;
        Ok(TokenPair {
            access_token,
            refresh_token: replacement,
        })
    }

    /// Revoke an access token early and tear the account's sessions down.
    ///
    /// # Errors
    /// `TokenExpired` or `TokenInvalid` from verification, or `Internal`
    /// from storage.
    pub async fn logout(&self, access_token: &str) -> Result<(), AuthError> {
        let claims = self.signer.verify(access_token)?;

        self.denylist
            .add(claims.jti, Some(claims.sub), claims.expires_at())
            .await?;
        let invalidated = self.sessions.invalidate_all(claims.sub).await?;
        self.refresh_tokens.revoke_all(claims.sub).await?;

        info!(account_id = %claims.sub, sessions = invalidated, "logged out");
        self.audit(Some(claims.sub), "LOGOUT", true).await;
        Ok(())
    }

    /// Per-request hook: verify a presented access token.
    ///
    /// A signature-valid token is still rejected when its identifier sits
    /// on the denylist.
    ///
    /// # Errors
    /// `TokenExpired`, `TokenInvalid`, `TokenRevoked`, or `Internal`.
    pub async fn authenticate(&self, access_token: &str) -> Result<AccessClaims, AuthError> {
        let claims = self.signer.verify(access_token)?;
        if self.denylist.contains(claims.jti).await? {
            return Err(AuthError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Per-request hook: take one rate limiter token for `identifier`.
    ///
    /// # Errors
    /// `RateLimitExceeded` carrying the retry-after hint.
    pub fn check_rate_limit(
        &self,
        class: LimiterClass,
        identifier: &str,
    ) -> Result<RateProbe, AuthError> {
        self.enforce_rate_limit(class, identifier)
    }

    /// Administrative unlock, clearing the failure counter.
    ///
    /// # Errors
    /// `Internal` from storage.
    pub async fn unlock_account(&self, account_id: Uuid) -> Result<(), AuthError> {
        self.security.unlock(account_id).await
    }

    /// Credential cleanup run before an account row is deleted: revoke
    /// refresh tokens, drop denylist entries, and hard-delete sessions.
    ///
    /// # Errors
    /// `Internal` from storage.
    pub async fn purge_account(&self, account_id: Uuid) -> Result<(), AuthError> {
        self.refresh_tokens.revoke_all(account_id).await?;
        self.denylist.purge_account(account_id).await?;
        let deleted = self.sessions.delete_all(account_id).await?;
        info!(account_id = %account_id, sessions = deleted, "purged account credentials");
        self.audit(Some(account_id), "ACCOUNT_DELETED", true).await;
        Ok(())
    }

    fn enforce_rate_limit(
        &self,
        class: LimiterClass,
        identifier: &str,
    ) -> Result<RateProbe, AuthError> {
        let quota = self.settings.snapshot().rate.quota(class);
        let probe = self.limiter.try_consume(class, identifier, quota);
        if probe.allowed {
            Ok(probe)
        } else {
            Err(AuthError::RateLimitExceeded {
                retry_after: probe.retry_after,
            })
        }
    }

    async fn audit(&self, account_id: Option<Uuid>, event: &str, success: bool) {
        if let Err(err) = self.audit.record_event(account_id, event, success).await {
            warn!(event, "audit write failed: {err:#}");
        }
    }

    async fn notify_login(&self, email: &str, success: bool) {
        if let Err(err) = self.notifier.notify_login(email, success).await {
            warn!(success, "login notification failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::collaborators::{NoopAudit, NoopNotifier};
    use crate::auth::denylist::InMemoryTokenDenylist;
    use crate::auth::lockout::{AccountStore, InMemoryAccountStore};
    use crate::auth::rate_limit::RateQuota;
    use crate::auth::refresh::InMemoryRefreshTokenStore;
    use crate::auth::session::InMemorySessionRegistry;
    use crate::auth::token::Role;
    use crate::clock::ManualClock;
    use crate::config::{RateSettings, RuntimeSettings};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::time::{Duration, UNIX_EPOCH};

    struct PasswordMap(HashMap<String, String>);

    #[async_trait]
    impl CredentialVerifier for PasswordMap {
        async fn check_password(&self, email: &str, password: &str) -> Result<bool, AuthError> {
            Ok(self.0.get(email).is_some_and(|stored| stored == password))
        }
    }

    struct Fixture {
        core: AuthCore,
        clock: ManualClock,
        accounts: Arc<InMemoryAccountStore>,
        account_id: Uuid,
    }

    const EMAIL: &str = "user@example.com";
    const PASSWORD: &str = "correct horse battery staple";

    fn fixture() -> Fixture {
        fixture_with(RuntimeSettings::default())
    }

    fn fixture_with(settings: RuntimeSettings) -> Fixture {
        let clock = ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let shared: Arc<dyn crate::clock::Clock> = Arc::new(clock.clone());

        let accounts = Arc::new(InMemoryAccountStore::new(Arc::clone(&shared)));
        let account_id = accounts.add_account(EMAIL, &[Role::User]);

        let secret = SecretString::from("0123456789abcdef0123456789abcdef".to_string());
        let signer = TokenSigner::new(&secret, Arc::clone(&shared)).expect("signer");

        let security = AccountSecurity::new(
            Arc::clone(&accounts) as Arc<dyn AccountStore>,
            Arc::new(NoopNotifier),
            Arc::new(NoopAudit),
            Arc::clone(&shared),
        );

        let core = AuthCore::new(
            signer,
            Arc::new(InMemoryRefreshTokenStore::new(Arc::clone(&shared))),
            Arc::new(InMemoryTokenDenylist::new(Arc::clone(&shared))),
            Arc::new(InMemorySessionRegistry::new(Arc::clone(&shared))),
            security,
            RateLimiter::new(Arc::clone(&shared)),
            Arc::new(PasswordMap(HashMap::from([(
                EMAIL.to_string(),
                PASSWORD.to_string(),
            )]))),
            Arc::new(NoopNotifier),
            Arc::new(NoopAudit),
            SettingsHandle::new(settings),
        );

        Fixture {
            core,
            clock,
            accounts,
            account_id,
        }
    }

    #[tokio::test]
    async fn login_issues_tokens_and_session() {
        let fx = fixture();
        let grant = fx
            .core
            .login(EMAIL, PASSWORD, Some("10.0.0.1"), Some("curl/8"))
            .await
            .expect("login");

        assert!(!grant.tokens.access_token.is_empty());
        assert!(!grant.tokens.refresh_token.is_empty());
        assert_eq!(grant.session.account_id, fx.account_id);

        let claims = fx
            .core
            .authenticate(&grant.tokens.access_token)
            .await
            .expect("authenticate");
        assert_eq!(claims.sub, fx.account_id);
        assert_eq!(claims.roles, vec![Role::User]);
    }

    #[tokio::test]
    async fn login_normalizes_the_email() {
        let fx = fixture();
        assert!(fx
            .core
            .login("  USER@Example.COM ", PASSWORD, None, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_fail_identically() {
        let fx = fixture();

        let err = fx
            .core
            .login(EMAIL, "wrong", Some("10.0.0.1"), None)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::InvalidCredentials));

        let err = fx
            .core
            .login("nobody@example.com", PASSWORD, Some("10.0.0.1"), None)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn repeated_failures_lock_even_with_the_right_password() {
        let fx = fixture();
        let max = fx.core.settings().snapshot().security.max_failed_attempts;

        for _ in 0..max {
            let _ = fx.core.login(EMAIL, "wrong", None, None).await;
        }

        let err = fx.core.login(EMAIL, PASSWORD, None, None).await.unwrap_err();
        assert!(err.is_kind(&AuthError::AccountLocked));
    }

    #[tokio::test]
    async fn lockout_expires_and_success_resets_the_counter() {
        let fx = fixture();
        let settings = fx.core.settings().snapshot();

        for _ in 0..settings.security.max_failed_attempts {
            let _ = fx.core.login(EMAIL, "wrong", None, None).await;
        }
        fx.clock
            .advance(settings.security.lockout_duration + Duration::from_secs(1));

        fx.core.login(EMAIL, PASSWORD, None, None).await.expect("login");

        let account = fx
            .accounts
            .find_by_id(fx.account_id)
            .await
            .expect("find")
            .expect("account");
        assert_eq!(account.failed_attempts, 0);
        assert!(account.locked_until.is_none());
    }

    #[tokio::test]
    async fn login_rate_limit_applies_per_ip() {
        let settings = RuntimeSettings {
            rate: RateSettings::default().with_quota(
                LimiterClass::Login,
                RateQuota::new(2, Duration::from_secs(3600)),
            ),
            ..RuntimeSettings::default()
        };
        let fx = fixture_with(settings);

        for _ in 0..2 {
            fx.core
                .login(EMAIL, PASSWORD, Some("10.0.0.1"), None)
                .await
                .expect("login");
        }

        let err = fx
            .core
            .login(EMAIL, PASSWORD, Some("10.0.0.1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimitExceeded { retry_after } if retry_after > Duration::ZERO));

        // A different source address is unaffected.
        assert!(fx
            .core
            .login(EMAIL, PASSWORD, Some("10.0.0.2"), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn refresh_rotates_and_retires_the_old_token() {
        let fx = fixture();
        let grant = fx.core.login(EMAIL, PASSWORD, None, None).await.expect("login");

        let pair = fx
            .core
            .refresh(&grant.tokens.refresh_token)
            .await
            .expect("refresh");
        assert_ne!(pair.refresh_token, grant.tokens.refresh_token);
        assert!(fx.core.authenticate(&pair.access_token).await.is_ok());

        let err = fx
            .core
            .refresh(&grant.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::TokenInvalid));
    }

    #[tokio::test]
    async fn logout_revokes_access_sessions_and_refresh() {
        let fx = fixture();
        let grant = fx.core.login(EMAIL, PASSWORD, None, None).await.expect("login");

        fx.core.logout(&grant.tokens.access_token).await.expect("logout");

        let err = fx
            .core
            .authenticate(&grant.tokens.access_token)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::TokenRevoked));

        let err = fx
            .core
            .refresh(&grant.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::TokenInvalid));

        let sessions = fx
            .core
            .sessions()
            .list_active(fx.account_id)
            .await
            .expect("list");
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn expired_access_token_reports_expired() {
        let fx = fixture();
        let grant = fx.core.login(EMAIL, PASSWORD, None, None).await.expect("login");
        let ttl = fx.core.settings().snapshot().security.access_token_ttl;

        fx.clock.advance(ttl + Duration::from_secs(1));
        let err = fx
            .core
            .authenticate(&grant.tokens.access_token)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn admin_unlock_restores_access() {
        let fx = fixture();
        let max = fx.core.settings().snapshot().security.max_failed_attempts;
        for _ in 0..max {
            let _ = fx.core.login(EMAIL, "wrong", None, None).await;
        }

        fx.core.unlock_account(fx.account_id).await.expect("unlock");
        assert!(fx.core.login(EMAIL, PASSWORD, None, None).await.is_ok());
    }

    #[tokio::test]
    async fn purge_account_clears_all_credentials() {
        let fx = fixture();
        let grant = fx.core.login(EMAIL, PASSWORD, None, None).await.expect("login");

        fx.core.purge_account(fx.account_id).await.expect("purge");

        let err = fx
            .core
            .refresh(&grant.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(err.is_kind(&AuthError::TokenInvalid));
        let sessions = fx
            .core
            .sessions()
            .list_active(fx.account_id)
            .await
            .expect("list");
        assert!(sessions.is_empty());
    }
}
