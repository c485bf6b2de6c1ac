use crate::api;
use crate::auth::collaborators::{NoopAudit, NoopNotifier, PgCredentialVerifier};
use crate::auth::denylist::PgTokenDenylist;
use crate::auth::lockout::{AccountSecurity, AccountStore, PgAccountStore};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::refresh::PgRefreshTokenStore;
use crate::auth::session::PgSessionRegistry;
use crate::auth::sweeper;
use crate::auth::token::TokenSigner;
use crate::auth::AuthCore;
use crate::cli::actions::Action;
use crate::clock::{Clock, SystemClock};
use crate::config::{RuntimeSettings, SettingsHandle};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    let Action::Server {
        port,
        dsn,
        token_secret,
        sweep_interval,
    } = action;

    let dsn = Url::parse(&dsn).context("invalid database DSN")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(dsn.as_str())
        .await
        .context("failed to connect to the database")?;

    let settings = RuntimeSettings::default();
    settings.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let signer = TokenSigner::new(&token_secret, Arc::clone(&clock))?;

    let refresh_tokens = Arc::new(PgRefreshTokenStore::new(pool.clone()));
    let denylist = Arc::new(PgTokenDenylist::new(pool.clone()));
    let sessions = Arc::new(PgSessionRegistry::new(pool.clone()));

    let security = AccountSecurity::new(
        Arc::new(PgAccountStore::new(pool.clone())) as Arc<dyn AccountStore>,
        Arc::new(NoopNotifier),
        Arc::new(NoopAudit),
        Arc::clone(&clock),
    );

    let core = AuthCore::new(
        signer,
        refresh_tokens.clone(),
        denylist.clone(),
        sessions.clone(),
        security,
        RateLimiter::new(Arc::clone(&clock)),
        Arc::new(PgCredentialVerifier::new(pool)),
        Arc::new(NoopNotifier),
        Arc::new(NoopAudit),
        SettingsHandle::new(settings),
    );

    let sweeper = sweeper::spawn(
        refresh_tokens,
        denylist,
        sessions,
        Duration::from_secs(sweep_interval),
    );

    let result = api::new(port, Arc::new(core)).await;

    sweeper.shutdown().await;
    result
}
