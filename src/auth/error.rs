//! Typed failure taxonomy for the authentication core.

use std::time::Duration;
use thiserror::Error;

/// Every failure the core surfaces to its callers.
///
/// Malformed, bad-signature, and unknown-refresh-token cases all collapse
/// into [`AuthError::TokenInvalid`] on purpose so responses never reveal
/// whether a token ever existed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account is locked")]
    AccountLocked,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token")]
    TokenInvalid,

    #[error("token revoked")]
    TokenRevoked,

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("session is expired or inactive")]
    SessionInvalid,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Discriminant comparison for tests and callers that only care about
    /// the kind, not any carried data.
    #[must_use]
    pub fn is_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_stay_low_detail() {
        assert_eq!(AuthError::InvalidCredentials.to_string(), "invalid credentials");
        assert_eq!(AuthError::TokenInvalid.to_string(), "invalid token");
        assert_eq!(AuthError::TokenRevoked.to_string(), "token revoked");
    }

    #[test]
    fn is_kind_ignores_payload() {
        let first = AuthError::RateLimitExceeded {
            retry_after: Duration::from_secs(1),
        };
        let second = AuthError::RateLimitExceeded {
            retry_after: Duration::from_secs(99),
        };
        assert!(first.is_kind(&second));
        assert!(!first.is_kind(&AuthError::TokenInvalid));
    }
}
