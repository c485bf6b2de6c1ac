//! Authentication and session lifecycle core.

pub mod collaborators;
pub mod denylist;
pub mod error;
pub mod lockout;
pub mod orchestrator;
pub mod rate_limit;
pub mod refresh;
pub mod session;
pub mod sweeper;
pub mod token;

pub use self::error::AuthError;
pub use self::orchestrator::{AuthCore, LoginGrant, TokenPair};
