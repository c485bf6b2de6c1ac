//! End-to-end flows through the authentication core with simulated time.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use uuid::Uuid;

use gardisto::auth::collaborators::{CredentialVerifier, NoopAudit, NoopNotifier};
use gardisto::auth::denylist::{InMemoryTokenDenylist, TokenDenylist};
use gardisto::auth::lockout::{AccountSecurity, AccountStore, InMemoryAccountStore};
use gardisto::auth::rate_limit::RateLimiter;
use gardisto::auth::refresh::{InMemoryRefreshTokenStore, RefreshTokenStore};
use gardisto::auth::session::{InMemorySessionRegistry, SessionRegistry};
use gardisto::auth::token::{Role, TokenSigner};
use gardisto::auth::{AuthCore, AuthError};
use gardisto::clock::{Clock, ManualClock};
use gardisto::config::SettingsHandle;

const EMAIL: &str = "user@example.com";
const PASSWORD: &str = "correct horse battery staple";

struct SinglePassword;

#[async_trait]
impl CredentialVerifier for SinglePassword {
    async fn check_password(&self, email: &str, password: &str) -> Result<bool, AuthError> {
        Ok(email == EMAIL && password == PASSWORD)
    }
}

struct Harness {
    core: AuthCore,
    clock: ManualClock,
    account_id: Uuid,
    accounts: Arc<InMemoryAccountStore>,
    denylist: Arc<InMemoryTokenDenylist>,
    sessions: Arc<InMemorySessionRegistry>,
    refresh_tokens: Arc<InMemoryRefreshTokenStore>,
}

fn harness() -> Harness {
    let clock = ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());

    let accounts = Arc::new(InMemoryAccountStore::new(Arc::clone(&shared)));
    let account_id = accounts.add_account(EMAIL, &[Role::User]);

    let denylist = Arc::new(InMemoryTokenDenylist::new(Arc::clone(&shared)));
    let sessions = Arc::new(InMemorySessionRegistry::new(Arc::clone(&shared)));
    let refresh_tokens = Arc::new(InMemoryRefreshTokenStore::new(Arc::clone(&shared)));

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
        Arc::clone(&refresh_tokens) as Arc<dyn RefreshTokenStore>,
        Arc::clone(&denylist) as Arc<dyn TokenDenylist>,
        Arc::clone(&sessions) as Arc<dyn SessionRegistry>,
        security,
        RateLimiter::new(Arc::clone(&shared)),
        Arc::new(SinglePassword),
        Arc::new(NoopNotifier),
        Arc::new(NoopAudit),
        SettingsHandle::default(),
    );

    Harness {
        core,
        clock,
        account_id,
        accounts,
        denylist,
        sessions,
        refresh_tokens,
    }
}

#[tokio::test]
async fn login_resets_failures_and_opens_one_session() -> AnyResult<()> {
    let h = harness();

    // A couple of failures first, below the lockout threshold.
    for _ in 0..2 {
        let _ = h.core.login(EMAIL, "wrong", Some("10.0.0.1"), None).await;
    }

    let grant = h
        .core
        .login(EMAIL, PASSWORD, Some("10.0.0.1"), Some("integration-test"))
        .await?;

    let account = h
        .accounts
        .find_by_id(h.account_id)
        .await?
        .expect("account");
    assert_eq!(account.failed_attempts, 0);

    let sessions = h.sessions.list_active(h.account_id).await?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, grant.session.id);

    let claims = h.core.authenticate(&grant.tokens.access_token).await?;
    assert_eq!(claims.sub, h.account_id);
    Ok(())
}

#[tokio::test]
async fn logout_cuts_access_sessions_and_refresh_tokens() -> AnyResult<()> {
    let h = harness();
    let grant = h.core.login(EMAIL, PASSWORD, None, None).await?;

    h.core.logout(&grant.tokens.access_token).await?;

    let err = h
        .core
        .authenticate(&grant.tokens.access_token)
        .await
        .unwrap_err();
    assert!(err.is_kind(&AuthError::TokenRevoked));

    assert!(h.sessions.list_active(h.account_id).await?.is_empty());

    let err = h
        .core
        .refresh(&grant.tokens.refresh_token)
        .await
        .unwrap_err();
    assert!(err.is_kind(&AuthError::TokenInvalid));
    Ok(())
}

#[tokio::test]
async fn lockout_window_opens_and_closes_with_the_clock() -> AnyResult<()> {
    let h = harness();
    let settings = h.core.settings().snapshot();

    for _ in 0..settings.security.max_failed_attempts {
        let err = h.core.login(EMAIL, "wrong", None, None).await.unwrap_err();
        assert!(err.is_kind(&AuthError::InvalidCredentials));
    }

    let err = h.core.login(EMAIL, PASSWORD, None, None).await.unwrap_err();
    assert!(err.is_kind(&AuthError::AccountLocked));

    // The lock expires lazily; no unlock call needed.
    h.clock
        .advance(settings.security.lockout_duration + Duration::from_secs(1));
    assert!(h.core.login(EMAIL, PASSWORD, None, None).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn expired_tokens_and_sessions_are_swept() -> AnyResult<()> {
    let h = harness();
    let settings = h.core.settings().snapshot();
    let grant = h.core.login(EMAIL, PASSWORD, None, None).await?;

    h.core.logout(&grant.tokens.access_token).await?;

    // Past the access TTL the denylist entry is reclaimable.
    h.clock
        .advance(settings.security.access_token_ttl + Duration::from_secs(1));
    assert_eq!(h.denylist.sweep_expired().await?, 1);

    // The revoked refresh token is reclaimable only past its own TTL.
    assert_eq!(h.refresh_tokens.sweep_expired().await?, 0);
    h.clock
        .advance(settings.security.refresh_token_ttl + Duration::from_secs(1));
    assert_eq!(h.refresh_tokens.sweep_expired().await?, 1);

    // The invalidated session goes on the next sweep.
    assert_eq!(h.sessions.sweep_expired().await?, 1);
    Ok(())
}

#[tokio::test]
async fn session_refresh_extends_expiry_until_invalidated() -> AnyResult<()> {
    let h = harness();
    let settings = h.core.settings().snapshot();
    let grant = h.core.login(EMAIL, PASSWORD, None, None).await?;

    h.clock.advance(Duration::from_secs(60));
    let refreshed = h
        .sessions
        .refresh(grant.session.id, settings.security.session_timeout)
        .await?;
    assert_eq!(
        refreshed.expires_at,
        h.clock.now() + settings.security.session_timeout
    );

    h.sessions.invalidate(grant.session.id).await?;
    let err = h
        .sessions
        .refresh(grant.session.id, settings.security.session_timeout)
        .await
        .unwrap_err();
    assert!(err.is_kind(&AuthError::SessionInvalid));
    Ok(())
}
