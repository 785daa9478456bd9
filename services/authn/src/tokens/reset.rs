//! Password-reset tokens.
//!
//! A reset token is a short-lived HS256 JWT whose `lock` claim digests the
//! password hash it was issued against. Consuming it re-fetches the account
//! and recomputes the digest, so the token goes inert the moment the
//! password changes: replay after a successful reset (or any other password
//! change) fails without any server-side token state.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use identity_token::{ResetClaims, sign_hs256, verify_hs256};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{Result, ServiceError};

pub const RESET_AUDIENCE: &str = "password-reset";

pub struct ResetIssuer {
    signing_key: Vec<u8>,
    issuer: String,
    ttl: Duration,
}

impl ResetIssuer {
    #[must_use]
    pub fn new(signing_key: Vec<u8>, issuer: String, ttl: Duration) -> Self {
        Self {
            signing_key,
            issuer,
            ttl,
        }
    }

    /// Digest of a password hash, as carried in the `lock` claim.
    #[must_use]
    pub fn lock_digest(password_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password_hash.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    /// Issue a reset token bound to the account's current password hash.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Backend`] when signing fails.
    pub fn issue(&self, account_id: i64, password_hash: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = ResetClaims {
            iss: self.issuer.clone(),
            aud: RESET_AUDIENCE.to_string(),
            sub: account_id.to_string(),
            lock: Self::lock_digest(password_hash),
            iat: now,
            exp: now + i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX),
        };
        sign_hs256(&self.signing_key, &claims)
            .map_err(|err| ServiceError::Backend(anyhow::anyhow!("failed to sign reset token: {err}")))
    }

    /// Validate signature, audience, and expiry, returning the claims.
    ///
    /// The caller still owns the second half of consumption: re-fetching the
    /// account named by `sub` and rejecting when [`Self::lock_digest`] of
    /// its current hash no longer matches the `lock` claim.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::TokenInvalid`] for any verification failure.
    pub fn verify(&self, token: &str) -> Result<ResetClaims> {
        verify_hs256(
            token,
            &self.signing_key,
            &self.issuer,
            RESET_AUDIENCE,
            Utc::now().timestamp(),
        )
        .map_err(|_| ServiceError::TokenInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUER: &str = "https://authn.example.test";

    fn issuer() -> ResetIssuer {
        ResetIssuer::new(
            b"reset-signing-key".to_vec(),
            ISSUER.to_string(),
            Duration::from_secs(1800),
        )
    }

    #[test]
    fn round_trip_binds_the_password_hash() -> Result<()> {
        let issuer = issuer();
        let token = issuer.issue(42, "$2b$12$stored-hash")?;
        let claims = issuer.verify(&token)?;

        assert_eq!(claims.sub, "42");
        assert_eq!(claims.aud, RESET_AUDIENCE);
        assert_eq!(claims.lock, ResetIssuer::lock_digest("$2b$12$stored-hash"));
        // Once the password changes, the recomputed digest no longer matches.
        assert_ne!(claims.lock, ResetIssuer::lock_digest("$2b$12$new-hash"));
        Ok(())
    }

    #[test]
    fn expired_token_is_invalid() -> Result<()> {
        let issuer = ResetIssuer::new(
            b"reset-signing-key".to_vec(),
            ISSUER.to_string(),
            Duration::ZERO,
        );
        let token = issuer.issue(42, "hash")?;
        assert!(matches!(
            issuer.verify(&token),
            Err(ServiceError::TokenInvalid)
        ));
        Ok(())
    }

    #[test]
    fn foreign_and_tampered_tokens_are_invalid() -> Result<()> {
        let issuer = issuer();
        let token = issuer.issue(42, "hash")?;

        let other = ResetIssuer::new(
            b"a-different-key".to_vec(),
            ISSUER.to_string(),
            Duration::from_secs(1800),
        );
        assert!(matches!(other.verify(&token), Err(ServiceError::TokenInvalid)));

        let mut tampered = token.clone();
        tampered.truncate(token.len() - 2);
        assert!(matches!(
            issuer.verify(&tampered),
            Err(ServiceError::TokenInvalid)
        ));

        assert!(matches!(
            issuer.verify("not-a-token"),
            Err(ServiceError::TokenInvalid)
        ));
        Ok(())
    }
}
