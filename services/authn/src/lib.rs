//! # Authn (Authentication Service)
//!
//! `authn` owns the identity lifecycle — signup, login, logout, password
//! change, password reset, archival — for end users of one or more
//! first-party web applications, and publishes verifiable identity tokens
//! that application backends consume without calling back on every request.
//!
//! ## Credential model
//!
//! - **Refresh tokens** are opaque, high-entropy, server-tracked values
//!   delivered as a session cookie and stored in the key-value backend with
//!   a sliding TTL.
//! - **Access tokens** are short-lived RS256 JWTs. Their `azp` claim carries
//!   a session fingerprint derived from the refresh token, binding the pair
//!   together: neither half is useful stolen alone.
//! - **Reset tokens** are short-lived HS256 JWTs whose `lock` claim digests
//!   the password hash they were issued against, so a password change makes
//!   them inert.
//!
//! ## Key lifecycle
//!
//! Identity signing keys either come from configuration (static, never
//! rotated) or are generated into the key-value backend and rotated on an
//! interval, coordinated across instances with an advisory lock. Prior keys
//! stay published in the JWKS until every access token signed under them has
//! expired.
//!
//! ## State machine
//!
//! Per account: `Active ⇄ Locked`, `Active → Archived` (terminal). Locking
//! and archival revoke all refresh tokens; archival also zeroes the username
//! and password hash. Unauthenticated paths never distinguish a locked
//! account from a bad password.

pub mod api;
pub mod cli;
pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod password;
pub mod service;
pub mod tokens;
pub mod webhook;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
