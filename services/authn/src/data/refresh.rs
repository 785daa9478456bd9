//! Refresh-token records.
//!
//! A refresh token is an opaque 128-bit random value, stored in the KV
//! backend with a TTL that slides on use. A per-account index key allows
//! revoking every token for an account without scanning the token space.
//! Entries missing from the store are indistinguishable from revoked ones.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::kv::Kv;

const TOKEN_PREFIX: &str = "refresh:token:";
const ACCOUNT_PREFIX: &str = "refresh:account:";

/// Value stored against a refresh token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshRecord {
    pub account_id: i64,
    /// Original authentication time, carried into the `auth_time` claim of
    /// every access token issued from this session.
    pub authenticated_at: i64,
}

pub struct RefreshTokenStore {
    kv: Arc<dyn Kv>,
    ttl: Duration,
}

fn token_key(token: &str) -> String {
    format!("{TOKEN_PREFIX}{token}")
}

fn index_key(account_id: i64, token: &str) -> String {
    format!("{ACCOUNT_PREFIX}{account_id}:{token}")
}

fn index_prefix(account_id: i64) -> String {
    format!("{ACCOUNT_PREFIX}{account_id}:")
}

impl RefreshTokenStore {
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Mint a new refresh token for an account.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend write fails.
    pub async fn create(
        &self,
        account_id: i64,
        authenticated_at: DateTime<Utc>,
    ) -> Result<String> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate refresh token")?;
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let record = RefreshRecord {
            account_id,
            authenticated_at: authenticated_at.timestamp(),
        };
        self.write(&token, &record).await?;
        Ok(token)
    }

    /// Look up the record behind a token. Expired, revoked, and never-issued
    /// tokens all read as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend read fails.
    pub async fn find(&self, token: &str) -> Result<Option<RefreshRecord>> {
        let Some(value) = self.kv.get(&token_key(token)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&value).context("corrupt refresh token record")?;
        Ok(Some(record))
    }

    /// Slide the expiry of an existing token out to the full TTL.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend write fails.
    pub async fn touch(&self, token: &str, record: &RefreshRecord) -> Result<()> {
        self.write(token, record).await
    }

    /// Remove one token. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when a backend operation fails.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        if let Some(record) = self.find(token).await? {
            self.kv.del(&index_key(record.account_id, token)).await?;
        }
        self.kv.del(&token_key(token)).await?;
        Ok(())
    }

    /// Remove every token for an account. Returns how many were revoked.
    ///
    /// # Errors
    ///
    /// Returns an error when a backend operation fails.
    pub async fn revoke_all(&self, account_id: i64) -> Result<usize> {
        let tokens = self.list(account_id).await?;
        for token in &tokens {
            self.kv.del(&token_key(token)).await?;
            self.kv.del(&index_key(account_id, token)).await?;
        }
        Ok(tokens.len())
    }

    /// Enumerate the live tokens of an account.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend read fails.
    pub async fn list(&self, account_id: i64) -> Result<Vec<String>> {
        let prefix = index_prefix(account_id);
        let keys = self.kv.keys_with_prefix(&prefix).await?;
        keys.into_iter()
            .map(|key| {
                key.strip_prefix(&prefix)
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("malformed refresh index key: {key}"))
            })
            .collect()
    }

    async fn write(&self, token: &str, record: &RefreshRecord) -> Result<()> {
        let value = serde_json::to_string(record).context("failed to encode refresh record")?;
        self.kv
            .set(&token_key(token), &value, Some(self.ttl))
            .await?;
        // Index entries share the token's TTL so the reverse index cannot
        // outlive the token itself.
        self.kv
            .set(&index_key(record.account_id, token), "1", Some(self.ttl))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::kv::MemoryKv;

    fn store() -> RefreshTokenStore {
        RefreshTokenStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn create_find_round_trip() -> Result<()> {
        let store = store();
        let issued_at = Utc::now();
        let token = store.create(42, issued_at).await?;
        // 16 random bytes become 22 characters of unpadded base64url.
        assert_eq!(token.len(), 22);

        let record = store.find(&token).await?.expect("token should exist");
        assert_eq!(record.account_id, 42);
        assert_eq!(record.authenticated_at, issued_at.timestamp());
        Ok(())
    }

    #[tokio::test]
    async fn tokens_are_unpredictable() -> Result<()> {
        let store = store();
        let first = store.create(1, Utc::now()).await?;
        let second = store.create(1, Utc::now()).await?;
        assert_ne!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_removes_exactly_one_token() -> Result<()> {
        let store = store();
        let keep = store.create(7, Utc::now()).await?;
        let drop = store.create(7, Utc::now()).await?;

        store.revoke(&drop).await?;
        assert!(store.find(&drop).await?.is_none());
        assert!(store.find(&keep).await?.is_some());
        assert_eq!(store.list(7).await?, vec![keep]);

        // Revoking again is a no-op.
        store.revoke(&drop).await?;
        Ok(())
    }

    #[tokio::test]
    async fn revoke_all_clears_only_that_account() -> Result<()> {
        let store = store();
        store.create(7, Utc::now()).await?;
        store.create(7, Utc::now()).await?;
        let other = store.create(8, Utc::now()).await?;

        assert_eq!(store.revoke_all(7).await?, 2);
        assert!(store.list(7).await?.is_empty());
        assert!(store.find(&other).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_token_reads_as_revoked() -> Result<()> {
        let store = store();
        assert!(store.find("never-issued").await?.is_none());
        Ok(())
    }
}
