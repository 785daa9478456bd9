//! bcrypt hashing with upgrade-on-verify.
//!
//! The configured cost may rise over an account's lifetime. `check` reports
//! when the stored hash carries a lower cost than the current configuration
//! so callers can re-hash and store after a successful login. The work
//! factor makes both operations CPU-heavy, so they run on the blocking pool
//! and always run to completion; a disconnected caller just discards the
//! result.

use anyhow::{Context, Result};

#[derive(Clone, Copy)]
pub struct PasswordHasher {
    cost: u32,
}

/// Outcome of a password verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordCheck {
    pub ok: bool,
    /// True when the stored hash's embedded cost is below the configured
    /// cost; the caller should re-hash and store on success.
    pub needs_upgrade: bool,
}

impl PasswordHasher {
    #[must_use]
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    /// Hash a password at the configured cost.
    ///
    /// # Errors
    ///
    /// Returns an error when hashing fails or the blocking task is lost.
    pub async fn hash(&self, password: &str) -> Result<String> {
        let cost = self.cost;
        let password = password.to_string();
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .context("password hashing task failed")?
            .context("failed to hash password")
    }

    /// Verify a password against a stored hash.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored hash is malformed or the blocking
    /// task is lost. A mismatched password is `ok: false`, not an error.
    pub async fn check(&self, password: &str, stored_hash: &str) -> Result<PasswordCheck> {
        let password = password.to_string();
        let hash = stored_hash.to_string();
        let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .context("password verification task failed")?
            .context("failed to verify password")?;

        let needs_upgrade = hash_cost(stored_hash).is_some_and(|stored| stored < self.cost);
        Ok(PasswordCheck { ok, needs_upgrade })
    }
}

/// Cost field of a modular-crypt bcrypt string (`$2b$12$...`).
fn hash_cost(hash: &str) -> Option<u32> {
    hash.split('$').nth(2)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The floor cost keeps these tests fast; production rejects below 10 at
    // the configuration boundary.
    const TEST_COST: u32 = 10;

    #[tokio::test]
    async fn hash_and_check_round_trip() -> Result<()> {
        let hasher = PasswordHasher::new(TEST_COST);
        let hash = hasher.hash("Tr0ub4dor&3").await?;
        assert!(hash.starts_with("$2"));

        let check = hasher.check("Tr0ub4dor&3", &hash).await?;
        assert!(check.ok);
        assert!(!check.needs_upgrade);

        let check = hasher.check("wrong password", &hash).await?;
        assert!(!check.ok);
        Ok(())
    }

    #[tokio::test]
    async fn lower_cost_hash_requests_upgrade() -> Result<()> {
        let old = PasswordHasher::new(TEST_COST);
        let hash = old.hash("Tr0ub4dor&3").await?;

        let new = PasswordHasher::new(TEST_COST + 2);
        let check = new.check("Tr0ub4dor&3", &hash).await?;
        assert!(check.ok);
        assert!(check.needs_upgrade);

        // A wrong password still reports the upgrade need but never passes.
        let check = new.check("wrong password", &hash).await?;
        assert!(!check.ok);
        assert!(check.needs_upgrade);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_hash_is_an_error() {
        let hasher = PasswordHasher::new(TEST_COST);
        assert!(hasher.check("password", "not-a-bcrypt-hash").await.is_err());
    }

    #[test]
    fn cost_parses_from_hash_string() {
        assert_eq!(
            hash_cost("$2b$12$abcdefghijklmnopqrstuvwxyz012345678901234567890123456"),
            Some(12)
        );
        assert_eq!(hash_cost("garbage"), None);
    }
}
