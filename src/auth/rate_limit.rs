//! In-memory token-bucket rate limiting keyed by (class, identifier).
//!
//! Buckets live for the process lifetime; a restart resets them to full
//! capacity. That tradeoff is deliberate: the key space is bounded by
//! active IPs and accounts, and cross-instance coordination is out of
//! scope for this core.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::clock::Clock;

/// Named limiter classes with independent quotas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimiterClass {
    Login,
    Registration,
    PasswordChange,
    OAuth,
    General,
}

impl LimiterClass {
    pub const ALL: [Self; 5] = [
        Self::Login,
        Self::Registration,
        Self::PasswordChange,
        Self::OAuth,
        Self::General,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Registration => "registration",
            Self::PasswordChange => "password-change",
            Self::OAuth => "oauth",
            Self::General => "general",
        }
    }
}

impl fmt::Display for LimiterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket shape: `capacity` requests per `window`, refilled in full every
/// elapsed window rather than dripped one token at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateQuota {
    pub capacity: u64,
    pub window: Duration,
}

impl RateQuota {
    #[must_use]
    pub const fn new(capacity: u64, window: Duration) -> Self {
        Self { capacity, window }
    }
}

/// Outcome of a single consume attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateProbe {
    pub allowed: bool,
    pub remaining: u64,
    /// Time until the next full refill; zero when the call was allowed.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: SystemTime,
}

/// Lazily-populated bucket registry.
///
/// The outer lock only guards map access; each bucket carries its own lock
/// so concurrent requests for different keys never contend.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<(LimiterClass, String), Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to take one token from the bucket for `(class, identifier)`.
    ///
    /// The quota is supplied per call so live configuration changes apply
    /// immediately to existing buckets.
    pub fn try_consume(
        &self,
        class: LimiterClass,
        identifier: &str,
        quota: RateQuota,
    ) -> RateProbe {
        let now = self.clock.now();
        let bucket = self.bucket(class, identifier, quota, now);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);

        refill(&mut bucket, quota, now);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            RateProbe {
                allowed: true,
                remaining: bucket.tokens,
                retry_after: Duration::ZERO,
            }
        } else {
            let next_refill = bucket.last_refill + quota.window;
            RateProbe {
                allowed: false,
                remaining: 0,
                retry_after: next_refill
                    .duration_since(now)
                    .unwrap_or(Duration::ZERO),
            }
        }
    }

    fn bucket(
        &self,
        class: LimiterClass,
        identifier: &str,
        quota: RateQuota,
        now: SystemTime,
    ) -> Arc<Mutex<Bucket>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buckets
                .entry((class, identifier.to_string()))
                .or_insert_with(|| {
                    // New buckets start full.
                    Arc::new(Mutex::new(Bucket {
                        tokens: quota.capacity,
                        last_refill: now,
                    }))
                }),
        )
    }

    /// Number of live buckets, for observability.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

fn refill(bucket: &mut Bucket, quota: RateQuota, now: SystemTime) {
    let elapsed = now
        .duration_since(bucket.last_refill)
        .unwrap_or(Duration::ZERO);
    if !quota.window.is_zero() && elapsed >= quota.window {
        // Interval refill: each elapsed window restores full capacity.
        let periods = elapsed.as_nanos() / quota.window.as_nanos();
        bucket.tokens = quota.capacity;
        bucket.last_refill += quota.window * u32::try_from(periods).unwrap_or(u32::MAX);
    }
    // Clamp in case the quota shrank since the last call.
    bucket.tokens = bucket.tokens.min(quota.capacity);
}
