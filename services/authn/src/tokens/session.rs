//! Session issuance and refresh.
//!
//! A successful authentication produces a pair: an opaque refresh token
//! (delivered as the session cookie, tracked server-side) and a signed
//! access token (returned in the response body, self-contained). The two are
//! bound by a fingerprint — a keyed digest of the refresh token — carried in
//! the access token's `azp` claim. A stolen access token is useless without
//! the cookie it was minted against, and a refresh token can only ever mint
//! access tokens bound to itself.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use identity_token::{IdentityClaims, sign_rs256};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::data::keys::KeyStore;
use crate::data::refresh::{RefreshRecord, RefreshTokenStore};
use crate::error::{Result, ServiceError};

pub struct SessionIssuer {
    keys: Arc<dyn KeyStore>,
    refresh: RefreshTokenStore,
    session_signing_key: Vec<u8>,
    issuer: String,
    access_ttl: Duration,
}

/// The credential pair returned to a freshly authenticated client.
pub struct Session {
    /// Opaque value for the session cookie.
    pub refresh_token: String,
    /// Signed identity token for the response body.
    pub access_token: String,
}

impl SessionIssuer {
    #[must_use]
    pub fn new(
        keys: Arc<dyn KeyStore>,
        refresh: RefreshTokenStore,
        session_signing_key: Vec<u8>,
        issuer: String,
        access_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            refresh,
            session_signing_key,
            issuer,
            access_ttl,
        }
    }

    /// Mint a fresh session for an account.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Backend`] when a store operation or signing
    /// fails.
    pub async fn issue(&self, account_id: i64, audience: &str) -> Result<Session> {
        let now = Utc::now();
        let refresh_token = self.refresh.create(account_id, now).await?;
        let record = RefreshRecord {
            account_id,
            authenticated_at: now.timestamp(),
        };
        let access_token = self.sign_access(&refresh_token, &record, audience).await?;
        Ok(Session {
            refresh_token,
            access_token,
        })
    }

    /// Exchange a live refresh token for a new access token, sliding the
    /// refresh expiry. Returns the account id alongside the token.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::SessionInvalid`] when the refresh token is
    /// unknown, expired, or revoked.
    pub async fn refresh(&self, refresh_token: &str, audience: &str) -> Result<(i64, String)> {
        let record = self
            .refresh
            .find(refresh_token)
            .await?
            .ok_or(ServiceError::SessionInvalid)?;
        self.refresh.touch(refresh_token, &record).await?;
        let access_token = self.sign_access(refresh_token, &record, audience).await?;
        Ok((record.account_id, access_token))
    }

    /// Account behind a live refresh token, without re-issuing anything.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::SessionInvalid`] for unknown tokens.
    pub async fn authenticate(&self, refresh_token: &str) -> Result<i64> {
        let record = self
            .refresh
            .find(refresh_token)
            .await?
            .ok_or(ServiceError::SessionInvalid)?;
        Ok(record.account_id)
    }

    /// Revoke one refresh token. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Backend`] when a store operation fails.
    pub async fn revoke(&self, refresh_token: &str) -> Result<()> {
        self.refresh.revoke(refresh_token).await?;
        Ok(())
    }

    /// Revoke every refresh token of an account.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Backend`] when a store operation fails.
    pub async fn revoke_all(&self, account_id: i64) -> Result<usize> {
        Ok(self.refresh.revoke_all(account_id).await?)
    }

    /// Keyed digest binding a refresh token to the access tokens minted from
    /// it.
    #[must_use]
    pub fn fingerprint(&self, refresh_token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(refresh_token.as_bytes());
        hasher.update(&self.session_signing_key);
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    async fn sign_access(
        &self,
        refresh_token: &str,
        record: &RefreshRecord,
        audience: &str,
    ) -> Result<String> {
        let key = self.keys.current().await?;
        let now = Utc::now().timestamp();
        let exp = now + i64::try_from(self.access_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = IdentityClaims {
            iss: self.issuer.clone(),
            sub: record.account_id.to_string(),
            aud: audience.to_string(),
            exp,
            iat: now,
            auth_time: record.authenticated_at,
            azp: self.fingerprint(refresh_token),
        };
        sign_rs256(&key.private_key, &key.kid, &claims)
            .map_err(|err| ServiceError::Backend(anyhow::anyhow!("failed to sign access token: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::keys::RotatingKeyStore;
    use crate::data::kv::{Kv, MemoryKv};
    use identity_token::verify_rs256;

    const ISSUER: &str = "https://authn.example.test";

    fn issuer_over(kv: Arc<dyn Kv>) -> SessionIssuer {
        let keys: Arc<dyn KeyStore> = Arc::new(RotatingKeyStore::new(
            kv.clone(),
            &[3u8; 32],
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        let refresh = RefreshTokenStore::new(kv, Duration::from_secs(3600));
        SessionIssuer::new(
            keys,
            refresh,
            b"session-signing-key".to_vec(),
            ISSUER.to_string(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn issued_access_token_verifies_under_published_keys() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let session = issuer_over(kv.clone()).issue(42, "app.example.com").await?;

        let keys: Arc<dyn KeyStore> = Arc::new(RotatingKeyStore::new(
            kv,
            &[3u8; 32],
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        let jwks = keys.keys().await.expect("jwks");
        let claims = verify_rs256(
            &session.access_token,
            &jwks,
            ISSUER,
            Some("app.example.com"),
            Utc::now().timestamp(),
        )
        .expect("token should verify");
        assert_eq!(claims.sub, "42");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_preserves_the_fingerprint_binding() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let issuer = issuer_over(kv);
        let session = issuer.issue(42, "app.example.com").await?;

        let (account_id, refreshed) = issuer
            .refresh(&session.refresh_token, "app.example.com")
            .await?;
        assert_eq!(account_id, 42);

        let expected = issuer.fingerprint(&session.refresh_token);
        for token in [&session.access_token, &refreshed] {
            let claims_b64 = token.split('.').nth(1).expect("claims segment");
            let claims: IdentityClaims = serde_json::from_slice(
                &URL_SAFE_NO_PAD.decode(claims_b64).expect("valid base64"),
            )
            .expect("valid claims");
            assert_eq!(claims.azp, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn refresh_of_a_revoked_token_fails() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let issuer = issuer_over(kv);
        let session = issuer.issue(42, "app.example.com").await?;

        issuer.revoke(&session.refresh_token).await?;
        let result = issuer.refresh(&session.refresh_token, "app.example.com").await;
        assert!(matches!(result, Err(ServiceError::SessionInvalid)));
        Ok(())
    }

    #[tokio::test]
    async fn fingerprint_is_keyed() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let issuer = issuer_over(kv);

        let plain = {
            let mut hasher = Sha256::new();
            hasher.update(b"some-refresh-token");
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        };
        // Without the signing key the digest differs, so the binding cannot
        // be forged from the refresh token alone.
        assert_ne!(issuer.fingerprint("some-refresh-token"), plain);
        assert_eq!(
            issuer.fingerprint("some-refresh-token"),
            issuer.fingerprint("some-refresh-token")
        );
    }

    #[tokio::test]
    async fn token_survives_rotation_within_retention() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let keys: Arc<dyn KeyStore> = Arc::new(RotatingKeyStore::new(
            kv.clone(),
            &[3u8; 32],
            // Zero interval: every rotate() installs a fresh current key.
            Duration::ZERO,
            Duration::from_secs(3600),
        ));
        let issuer = SessionIssuer::new(
            keys.clone(),
            RefreshTokenStore::new(kv, Duration::from_secs(3600)),
            b"session-signing-key".to_vec(),
            ISSUER.to_string(),
            Duration::from_secs(3600),
        );

        let session = issuer.issue(42, "app.example.com").await?;
        keys.rotate().await.expect("rotation");

        // Just before the access TTL elapses, the old token still verifies
        // against the published keyset.
        let jwks = keys.keys().await.expect("jwks");
        let almost_expired = Utc::now().timestamp() + 3600 - 5;
        let claims = verify_rs256(&session.access_token, &jwks, ISSUER, None, almost_expired)
            .expect("token should verify across rotation");
        assert_eq!(claims.sub, "42");
        Ok(())
    }
}
