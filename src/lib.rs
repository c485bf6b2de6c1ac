//! Account authentication and session lifecycle service.
//!
//! The [`auth`] module holds the core: token signing and verification,
//! rotating refresh tokens, a denylist for early-revoked access tokens,
//! per-identifier rate limiting, account lockout, and session tracking.
//! [`api`] exposes the core over HTTP and [`cli`] wires everything
//! together at startup.

pub mod api;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
