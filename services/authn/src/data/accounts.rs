//! Account persistence.
//!
//! Accounts live in PostgreSQL in production ([`PgAccountStore`]) and in
//! memory for tests ([`MemoryAccountStore`]). Uniqueness of `username` is
//! enforced among non-deleted rows only, with first-writer-wins semantics on
//! insertion; archival soft-deletes the row and zeroes both the username and
//! the password hash.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::sync::Mutex;
use tracing::{Instrument, info_span};

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub username: String,
    /// bcrypt hash string. Never serialized across the service boundary.
    pub password_hash: String,
    pub locked: bool,
    pub deleted: bool,
    pub require_new_password: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an account insertion.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Account),
    Taken,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account. Loses the race to an existing non-deleted
    /// username and reports [`CreateOutcome::Taken`].
    async fn create(&self, username: &str, password_hash: &str) -> Result<CreateOutcome>;

    async fn find(&self, id: i64) -> Result<Option<Account>>;

    /// Look up a non-deleted account by username.
    async fn find_by_username(&self, username: &str) -> Result<Option<Account>>;

    /// Replace the password hash and clear the require-new-password flag.
    /// Returns false when the account is missing or archived.
    async fn set_password(&self, id: i64, password_hash: &str) -> Result<bool>;

    async fn set_locked(&self, id: i64, locked: bool) -> Result<bool>;

    /// Soft-delete: zero the username and hash, mark deleted. Terminal.
    async fn archive(&self, id: i64) -> Result<bool>;

    /// Force a password change on the next successful authentication.
    async fn require_new_password(&self, id: i64) -> Result<bool>;
}

/// PostgreSQL-backed [`AccountStore`].
///
/// Expected schema (see `migrations/`): `accounts(id BIGSERIAL, username,
/// password_hash, locked, require_new_password, deleted_at, created_at,
/// updated_at)` with a unique index on `username` where `deleted_at IS NULL`.
pub struct PgAccountStore {
    pool: PgPool,
}

const ACCOUNT_COLUMNS: &str =
    "id, username, password_hash, locked, require_new_password, deleted_at, created_at, updated_at";

impl PgAccountStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &PgRow) -> Account {
    let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
    Account {
        id: row.get("id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        locked: row.get("locked"),
        deleted: deleted_at.is_some(),
        require_new_password: row.get("require_new_password"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn create(&self, username: &str, password_hash: &str) -> Result<CreateOutcome> {
        let query = format!(
            "INSERT INTO accounts (username, password_hash) VALUES ($1, $2) RETURNING {ACCOUNT_COLUMNS}"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(username)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

        match row {
            Ok(row) => Ok(CreateOutcome::Created(account_from_row(&row))),
            Err(err) if is_unique_violation(&err) => Ok(CreateOutcome::Taken),
            Err(err) => Err(err).context("failed to insert account"),
        }
    }

    async fn find(&self, id: i64) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to find account")?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = $1 AND deleted_at IS NULL"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let row = sqlx::query(&query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to find account by username")?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn set_password(&self, id: i64, password_hash: &str) -> Result<bool> {
        let query = "UPDATE accounts \
             SET password_hash = $2, require_new_password = FALSE, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update password hash")?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_locked(&self, id: i64, locked: bool) -> Result<bool> {
        let query = "UPDATE accounts SET locked = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(locked)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update lock state")?;
        Ok(result.rows_affected() > 0)
    }

    async fn archive(&self, id: i64) -> Result<bool> {
        let query = "UPDATE accounts \
             SET username = '', password_hash = '', deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to archive account")?;
        Ok(result.rows_affected() > 0)
    }

    async fn require_new_password(&self, id: i64) -> Result<bool> {
        let query = "UPDATE accounts SET require_new_password = TRUE, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to flag password expiry")?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-process [`AccountStore`] mirroring the PostgreSQL semantics.
#[derive(Default)]
pub struct MemoryAccountStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    accounts: Vec<Account>,
}

impl MemoryAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create(&self, username: &str, password_hash: &str) -> Result<CreateOutcome> {
        let mut state = self.lock();
        let taken = state
            .accounts
            .iter()
            .any(|account| !account.deleted && account.username == username);
        if taken {
            return Ok(CreateOutcome::Taken);
        }
        state.next_id += 1;
        let now = Utc::now();
        let account = Account {
            id: state.next_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            locked: false,
            deleted: false,
            require_new_password: false,
            created_at: now,
            updated_at: now,
        };
        state.accounts.push(account.clone());
        Ok(CreateOutcome::Created(account))
    }

    async fn find(&self, id: i64) -> Result<Option<Account>> {
        let state = self.lock();
        Ok(state
            .accounts
            .iter()
            .find(|account| account.id == id)
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Account>> {
        let state = self.lock();
        Ok(state
            .accounts
            .iter()
            .find(|account| !account.deleted && account.username == username)
            .cloned())
    }

    async fn set_password(&self, id: i64, password_hash: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(account) = state
            .accounts
            .iter_mut()
            .find(|account| account.id == id && !account.deleted)
        else {
            return Ok(false);
        };
        account.password_hash = password_hash.to_string();
        account.require_new_password = false;
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_locked(&self, id: i64, locked: bool) -> Result<bool> {
        let mut state = self.lock();
        let Some(account) = state
            .accounts
            .iter_mut()
            .find(|account| account.id == id && !account.deleted)
        else {
            return Ok(false);
        };
        account.locked = locked;
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn archive(&self, id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(account) = state
            .accounts
            .iter_mut()
            .find(|account| account.id == id && !account.deleted)
        else {
            return Ok(false);
        };
        account.username = String::new();
        account.password_hash = String::new();
        account.deleted = true;
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn require_new_password(&self, id: i64) -> Result<bool> {
        let mut state = self.lock();
        let Some(account) = state
            .accounts
            .iter_mut()
            .find(|account| account.id == id && !account.deleted)
        else {
            return Ok(false);
        };
        account.require_new_password = true;
        account.updated_at = Utc::now();
        Ok(true)
    }
}
