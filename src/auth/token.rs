//! Access token signing and verification.
//!
//! Access tokens are short-lived HS512 JWTs carrying the subject, role
//! list, and a unique `jti` the denylist can reference. Refresh tokens are
//! deliberately NOT signed tokens; they are opaque random strings validated
//! only against the refresh token store.

use anyhow::{bail, Result};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use uuid::Uuid;

use super::error::AuthError;
use crate::clock::{from_unix_seconds, Clock};

/// HS512 wants at least a 256-bit secret.
pub const MIN_SECRET_BYTES: usize = 32;

/// Authorization roles are a small fixed set; no policy engine here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(AuthError::TokenInvalid),
        }
    }
}

/// Claims embedded in every access token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub roles: Vec<Role>,
    pub jti: Uuid,
}

impl AccessClaims {
    /// Expiry as a timestamp, for mirroring into the denylist.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        from_unix_seconds(self.exp)
    }
}

/// Verification failures, kept distinct here; callers outside the core see
/// them collapsed through [`AuthError`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("unsupported token")]
    Unsupported,
}

impl From<VerifyError> for AuthError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Expired => Self::TokenExpired,
            VerifyError::Malformed | VerifyError::SignatureInvalid | VerifyError::Unsupported => {
                Self::TokenInvalid
            }
        }
    }
}

/// Stateless signer/verifier over a shared secret.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock: Arc<dyn Clock>,
}

impl TokenSigner {
    /// Build a signer, rejecting short secrets at startup.
    ///
    /// # Errors
    /// Returns an error if the secret is shorter than 256 bits.
    pub fn new(secret: &SecretString, clock: Arc<dyn Clock>) -> Result<Self> {
        let bytes = secret.expose_secret().as_bytes();
        if bytes.len() < MIN_SECRET_BYTES {
            bail!(
                "token signing secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
                bytes.len()
            );
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            clock,
        })
    }

    /// Issue a signed access token for `subject` with the given roles.
    ///
    /// # Errors
    /// Returns [`AuthError::Internal`] if encoding fails.
    pub fn issue(&self, subject: Uuid, roles: &[Role], ttl: Duration) -> Result<String, AuthError> {
        let now = self.clock.unix_seconds();
        let claims = AccessClaims {
            sub: subject,
            iat: now,
            exp: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
            roles: roles.to_vec(),
            jti: Uuid::new_v4(),
        };
        encode(&Header::new(Algorithm::HS512), &claims, &self.encoding)
            .map_err(|err| AuthError::Internal(anyhow::Error::new(err).context("encode access token")))
    }

    /// Verify signature and expiry, returning the embedded claims.
    ///
    /// Expiry is checked against the injected clock, not the library's
    /// wall-clock default, so it can be simulated in tests.
    ///
    /// # Errors
    /// See [`VerifyError`].
    pub fn verify(&self, token: &str) -> Result<AccessClaims, VerifyError> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.validate_exp = false;

        let data = decode::<AccessClaims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    VerifyError::Unsupported
                }
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Malformed,
            }
        })?;

        if data.claims.exp <= self.clock.unix_seconds() {
            return Err(VerifyError::Expired);
        }

        Ok(data.claims)
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}
