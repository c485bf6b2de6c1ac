//! Runtime-tunable settings shared behind an atomic snapshot handle.
//!
//! Components never cache these values: every operation takes a fresh
//! snapshot so live updates (admin tooling, ops overrides) apply on the
//! next call without a restart.

use anyhow::{bail, Result};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::auth::rate_limit::{LimiterClass, RateQuota};

const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_MINUTES: u64 = 30;
const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: u64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_SESSION_TIMEOUT_MINUTES: u64 = 30;

/// Account security and token lifetime knobs.
#[derive(Clone, Debug)]
pub struct SecuritySettings {
    pub max_failed_attempts: u32,
    pub lockout_duration: Duration,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub session_timeout: Duration,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            lockout_duration: Duration::from_secs(DEFAULT_LOCKOUT_MINUTES * 60),
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECONDS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TOKEN_TTL_SECONDS),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_MINUTES * 60),
        }
    }
}

impl SecuritySettings {
    #[must_use]
    pub fn with_max_failed_attempts(mut self, attempts: u32) -> Self {
        self.max_failed_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_lockout_duration(mut self, duration: Duration) -> Self {
        self.lockout_duration = duration;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// Per-class rate limiter quotas.
#[derive(Clone, Debug)]
pub struct RateSettings {
    pub login: RateQuota,
    pub registration: RateQuota,
    pub password_change: RateQuota,
    pub oauth: RateQuota,
    pub general: RateQuota,
}

impl Default for RateSettings {
    fn default() -> Self {
        let hour = Duration::from_secs(60 * 60);
        Self {
            login: RateQuota::new(10, hour),
            registration: RateQuota::new(10, hour),
            password_change: RateQuota::new(5, hour),
            oauth: RateQuota::new(10, hour),
            general: RateQuota::new(50_000, hour),
        }
    }
}

impl RateSettings {
    #[must_use]
    pub fn quota(&self, class: LimiterClass) -> RateQuota {
        match class {
            LimiterClass::Login => self.login,
            LimiterClass::Registration => self.registration,
            LimiterClass::PasswordChange => self.password_change,
            LimiterClass::OAuth => self.oauth,
            LimiterClass::General => self.general,
        }
    }

    #[must_use]
    pub fn with_quota(mut self, class: LimiterClass, quota: RateQuota) -> Self {
        match class {
            LimiterClass::Login => self.login = quota,
            LimiterClass::Registration => self.registration = quota,
            LimiterClass::PasswordChange => self.password_change = quota,
            LimiterClass::OAuth => self.oauth = quota,
            LimiterClass::General => self.general = quota,
        }
        self
    }
}

/// Everything the orchestrator re-reads per call.
#[derive(Clone, Debug, Default)]
pub struct RuntimeSettings {
    pub security: SecuritySettings,
    pub rate: RateSettings,
}

impl RuntimeSettings {
    /// Startup validation; bad values are a deploy error, not a runtime path.
    pub fn validate(&self) -> Result<()> {
        if self.security.max_failed_attempts == 0 {
            bail!("max-failed-attempts must be greater than 0");
        }
        if self.security.lockout_duration.is_zero() {
            bail!("lockout-duration must be greater than 0");
        }
        if self.security.access_token_ttl.is_zero() || self.security.refresh_token_ttl.is_zero() {
            bail!("token lifetimes must be greater than 0");
        }
        if self.security.session_timeout.is_zero() {
            bail!("session-timeout must be greater than 0");
        }
        for class in LimiterClass::ALL {
            let quota = self.rate.quota(class);
            if quota.capacity == 0 {
                bail!("rate limit capacity for {class} must be greater than 0");
            }
            if quota.window.is_zero() {
                bail!("rate limit window for {class} must be greater than 0");
            }
        }
        Ok(())
    }
}

/// Shared handle over the current settings snapshot.
///
/// Readers get an `Arc` to an immutable snapshot; writers swap the whole
/// snapshot. A call in flight keeps the snapshot it started with.
#[derive(Clone, Debug)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<RuntimeSettings>>>,
}

impl SettingsHandle {
    #[must_use]
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, settings: RuntimeSettings) {
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(settings);
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(RuntimeSettings::default())
    }
}
