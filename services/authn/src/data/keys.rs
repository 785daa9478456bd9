//! Identity signing keys.
//!
//! Access tokens are signed with an RSA key that either comes from
//! configuration ([`StaticKeyStore`], never rotates) or is generated and
//! rotated through the KV backend ([`RotatingKeyStore`]). Rotation demotes
//! the current key rather than destroying it: a key signs for one rotation
//! interval, then stays published for one further retention window so
//! outstanding access tokens remain verifiable, and is garbage-collected
//! after that.
//!
//! Multi-instance deployments coordinate generation through an advisory
//! `SETNX` lock whose TTL is kept well below the rotation interval, so a
//! crashed holder cannot stall rotation for long.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use identity_token::jwks::{Jwk, Jwks, thumbprint};
use rand::{RngCore, rngs::OsRng};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::kv::Kv;

const ENTRY_PREFIX: &str = "identity-keys:entry:";
const CURRENT_KEY: &str = "identity-keys:current";
const ROTATION_LOCK_KEY: &str = "identity-keys:rotation-lock";

const IDENTITY_KEY_BITS: usize = 2048;

#[derive(Clone)]
pub struct IdentityKey {
    pub kid: String,
    pub private_key: RsaPrivateKey,
    pub created_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl IdentityKey {
    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// The key access tokens are signed with right now. Creates one when the
    /// keychain is empty; fails the request (not the process) when none can
    /// be produced.
    async fn current(&self) -> Result<IdentityKey>;

    /// Public halves of every currently-trusted key (current and retained
    /// prior keys), as a JWKS document.
    async fn keys(&self) -> Result<Jwks>;

    /// Generate a replacement when the current key is missing or past its
    /// rotation interval, and garbage-collect keys past their `not_after`.
    async fn rotate(&self) -> Result<()>;
}

/// Key store around a configuration-supplied RSA key. Never rotates.
pub struct StaticKeyStore {
    key: IdentityKey,
}

impl StaticKeyStore {
    #[must_use]
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let kid = thumbprint(&RsaPublicKey::from(&private_key));
        let now = Utc::now();
        Self {
            key: IdentityKey {
                kid,
                private_key,
                created_at: now,
                not_before: now,
                not_after: DateTime::<Utc>::MAX_UTC,
            },
        }
    }
}

#[async_trait]
impl KeyStore for StaticKeyStore {
    async fn current(&self) -> Result<IdentityKey> {
        Ok(self.key.clone())
    }

    async fn keys(&self) -> Result<Jwks> {
        let jwk = Jwk::from_rsa_public_key(&self.key.public_key(), self.key.kid.clone())
            .map_err(|err| anyhow!("failed to build JWK: {err}"))?;
        Ok(Jwks { keys: vec![jwk] })
    }

    async fn rotate(&self) -> Result<()> {
        Ok(())
    }
}

/// Serialized form of a key entry, encrypted at rest in the KV backend.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    private_key_pem: String,
    created_at: i64,
    not_before: i64,
    not_after: i64,
}

/// KV-coordinated key store shared by every service instance.
pub struct RotatingKeyStore {
    kv: Arc<dyn Kv>,
    cipher: Aes256Gcm,
    rotation_interval: Duration,
    retention: Duration,
    /// Decrypted entries by kid. RSA decryption of stored blobs is cheap but
    /// parsing keys on every request is not; the pointer read stays
    /// uncached so instances converge promptly after a rotation.
    cache: Mutex<HashMap<String, IdentityKey>>,
}

impl RotatingKeyStore {
    #[must_use]
    pub fn new(
        kv: Arc<dyn Kv>,
        encryption_key: &[u8; 32],
        rotation_interval: Duration,
        retention: Duration,
    ) -> Self {
        let cipher = Aes256Gcm::new(encryption_key.into());
        Self {
            kv,
            cipher,
            rotation_interval,
            retention,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_ttl(&self) -> Duration {
        // Stale-lock recovery requires the TTL to sit comfortably below the
        // rotation interval.
        let tenth = self.rotation_interval / 10;
        tenth.clamp(Duration::from_secs(5), Duration::from_secs(60))
    }

    async fn lookup(&self, kid: &str) -> Result<Option<IdentityKey>> {
        {
            let cache = self.cache.lock().await;
            if let Some(key) = cache.get(kid) {
                return Ok(Some(key.clone()));
            }
        }
        let Some(value) = self.kv.get(&format!("{ENTRY_PREFIX}{kid}")).await? else {
            return Ok(None);
        };
        let key = self.decrypt_entry(&value)?;
        let mut cache = self.cache.lock().await;
        cache.insert(key.kid.clone(), key.clone());
        Ok(Some(key))
    }

    async fn current_key(&self) -> Result<Option<IdentityKey>> {
        let Some(kid) = self.kv.get(CURRENT_KEY).await? else {
            return Ok(None);
        };
        self.lookup(&kid).await
    }

    async fn live_keys(&self) -> Result<Vec<IdentityKey>> {
        let now = Utc::now();
        let entry_keys = self.kv.keys_with_prefix(ENTRY_PREFIX).await?;
        let mut keys = Vec::with_capacity(entry_keys.len());
        for entry_key in entry_keys {
            let Some(kid) = entry_key.strip_prefix(ENTRY_PREFIX) else {
                continue;
            };
            let Some(key) = self.lookup(kid).await? else {
                continue;
            };
            if key.not_after > now {
                keys.push(key);
            }
        }
        // Newest first, so the JWKS leads with the signing key.
        keys.sort_by_key(|key| std::cmp::Reverse(key.created_at));
        Ok(keys)
    }

    async fn generate_and_install(&self) -> Result<IdentityKey> {
        let private_key =
            tokio::task::spawn_blocking(|| RsaPrivateKey::new(&mut OsRng, IDENTITY_KEY_BITS))
                .await
                .context("identity key generation task failed")?
                .context("failed to generate identity key")?;

        let now = Utc::now();
        let not_after = now
            + chrono::Duration::from_std(self.rotation_interval + self.retention)
                .context("rotation interval out of range")?;
        let key = IdentityKey {
            kid: thumbprint(&RsaPublicKey::from(&private_key)),
            private_key,
            created_at: now,
            not_before: now,
            not_after,
        };

        let value = self.encrypt_entry(&key)?;
        self.kv
            .set(&format!("{ENTRY_PREFIX}{}", key.kid), &value, None)
            .await?;
        self.kv.set(CURRENT_KEY, &key.kid, None).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(key.kid.clone(), key.clone());
        info!(kid = %key.kid, "installed new identity key");
        Ok(key)
    }

    async fn garbage_collect(&self) -> Result<()> {
        let now = Utc::now();
        let entry_keys = self.kv.keys_with_prefix(ENTRY_PREFIX).await?;
        for entry_key in entry_keys {
            let Some(kid) = entry_key.strip_prefix(ENTRY_PREFIX) else {
                continue;
            };
            let Some(key) = self.lookup(kid).await? else {
                continue;
            };
            if key.not_after <= now {
                self.kv.del(&entry_key).await?;
                self.cache.lock().await.remove(kid);
                info!(kid = %kid, "garbage-collected expired identity key");
            }
        }
        Ok(())
    }

    fn needs_rotation(&self, current: Option<&IdentityKey>) -> bool {
        match current {
            None => true,
            Some(key) => {
                let age = Utc::now().timestamp() - key.created_at.timestamp();
                age >= i64::try_from(self.rotation_interval.as_secs()).unwrap_or(i64::MAX)
            }
        }
    }

    fn encrypt_entry(&self, key: &IdentityKey) -> Result<String> {
        let pem = key
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("failed to encode identity key")?;
        let stored = StoredKey {
            private_key_pem: pem.to_string(),
            created_at: key.created_at.timestamp(),
            not_before: key.not_before.timestamp(),
            not_after: key.not_after.timestamp(),
        };
        let plaintext = serde_json::to_vec(&stored).context("failed to encode key entry")?;

        let mut nonce_bytes = [0u8; 12];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .context("failed to generate nonce")?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| anyhow!("failed to encrypt key entry"))?;

        let mut blob = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    fn decrypt_entry(&self, value: &str) -> Result<IdentityKey> {
        let blob = STANDARD
            .decode(value)
            .context("corrupt identity key entry")?;
        if blob.len() < 12 {
            return Err(anyhow!("corrupt identity key entry"));
        }
        let (nonce, ciphertext) = blob.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("failed to decrypt identity key entry"))?;
        let stored: StoredKey =
            serde_json::from_slice(&plaintext).context("corrupt identity key entry")?;

        let private_key = RsaPrivateKey::from_pkcs8_pem(&stored.private_key_pem)
            .context("failed to parse stored identity key")?;
        Ok(IdentityKey {
            kid: thumbprint(&RsaPublicKey::from(&private_key)),
            private_key,
            created_at: timestamp(stored.created_at)?,
            not_before: timestamp(stored.not_before)?,
            not_after: timestamp(stored.not_after)?,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp out of range: {secs}"))
}

#[async_trait]
impl KeyStore for RotatingKeyStore {
    async fn current(&self) -> Result<IdentityKey> {
        let current = self.current_key().await?;
        if !self.needs_rotation(current.as_ref()) {
            if let Some(key) = current {
                return Ok(key);
            }
        }
        self.rotate().await?;
        self.current_key()
            .await?
            .ok_or_else(|| anyhow!("no identity key available"))
    }

    async fn keys(&self) -> Result<Jwks> {
        let keys = self
            .live_keys()
            .await?
            .iter()
            .map(|key| {
                Jwk::from_rsa_public_key(&key.public_key(), key.kid.clone())
                    .map_err(|err| anyhow!("failed to build JWK: {err}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Jwks { keys })
    }

    async fn rotate(&self) -> Result<()> {
        self.garbage_collect().await?;

        let current = self.current_key().await?;
        if !self.needs_rotation(current.as_ref()) {
            return Ok(());
        }

        let mut holder = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut holder)
            .context("failed to generate lock token")?;
        let acquired = self
            .kv
            .set_nx(ROTATION_LOCK_KEY, &STANDARD.encode(holder), self.lock_ttl())
            .await?;
        if !acquired {
            // Another instance is generating; its pointer write will be
            // picked up on the next current() call.
            return Ok(());
        }

        let result = self.generate_and_install().await;
        self.kv.del(ROTATION_LOCK_KEY).await?;
        result.map(|_| ())
    }
}

/// Run `rotate()` on a fixed cadence in the background.
pub fn spawn_rotation_worker(
    store: Arc<dyn KeyStore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = store.rotate().await {
                error!("identity key rotation failed: {err:#}");
            }
            tokio::time::sleep(period).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::kv::MemoryKv;

    fn rotating(kv: Arc<dyn Kv>, interval: Duration) -> RotatingKeyStore {
        RotatingKeyStore::new(kv, &[7u8; 32], interval, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn current_creates_a_key_when_missing() -> Result<()> {
        let store = rotating(Arc::new(MemoryKv::new()), Duration::from_secs(3600));
        let key = store.current().await?;
        assert_eq!(key.kid.len(), 43);
        assert!(key.not_after > key.not_before);

        // A second call returns the same key, not a fresh one.
        let again = store.current().await?;
        assert_eq!(again.kid, key.kid);
        Ok(())
    }

    #[tokio::test]
    async fn keychain_is_shared_through_the_backend() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let first = rotating(kv.clone(), Duration::from_secs(3600));
        let key = first.current().await?;

        // A separate instance over the same backend sees the same key.
        let second = rotating(kv, Duration::from_secs(3600));
        assert_eq!(second.current().await?.kid, key.kid);
        Ok(())
    }

    #[tokio::test]
    async fn stored_entries_are_not_plaintext() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let store = rotating(kv.clone(), Duration::from_secs(3600));
        let key = store.current().await?;

        let value = kv
            .get(&format!("{ENTRY_PREFIX}{}", key.kid))
            .await?
            .expect("entry exists");
        assert!(!value.contains("BEGIN PRIVATE KEY"));

        // A store with a different encryption key cannot read the entry.
        let other = RotatingKeyStore::new(
            kv,
            &[9u8; 32],
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert!(other.current_key().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn aged_out_key_is_demoted_but_still_published() -> Result<()> {
        // Zero interval: every rotate() call produces a new current key.
        let store = rotating(Arc::new(MemoryKv::new()), Duration::ZERO);
        let old = store.current().await?;
        store.rotate().await?;
        let new = store.current().await?;
        assert_ne!(old.kid, new.kid);

        // The demoted key stays in the JWKS for its retention window.
        let jwks = store.keys().await?;
        assert!(jwks.find_by_kid(&old.kid).is_some());
        assert!(jwks.find_by_kid(&new.kid).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_keys_are_garbage_collected() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        // Zero interval and zero retention: keys expire the moment they exist.
        let store = RotatingKeyStore::new(kv.clone(), &[7u8; 32], Duration::ZERO, Duration::ZERO);
        let old = store.current().await?;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        store.rotate().await?;
        assert!(
            kv.get(&format!("{ENTRY_PREFIX}{}", old.kid)).await?.is_none(),
            "expired entry should be deleted"
        );
        Ok(())
    }

    #[tokio::test]
    async fn rotation_lock_prevents_concurrent_generation() -> Result<()> {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        // Hold the advisory lock; rotate() must yield without installing a key.
        kv.set_nx(ROTATION_LOCK_KEY, "other-instance", Duration::from_secs(60))
            .await?;

        let store = rotating(kv.clone(), Duration::from_secs(3600));
        store.rotate().await?;
        assert!(kv.get(CURRENT_KEY).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn static_store_never_rotates() -> Result<()> {
        let private_key =
            tokio::task::spawn_blocking(|| RsaPrivateKey::new(&mut OsRng, IDENTITY_KEY_BITS))
                .await?
                .expect("keygen");
        let store = StaticKeyStore::new(private_key);
        let before = store.current().await?;
        store.rotate().await?;
        let after = store.current().await?;
        assert_eq!(before.kid, after.kid);
        assert_eq!(store.keys().await?.keys.len(), 1);
        Ok(())
    }
}
