//! The account service: every credential flow the HTTP layer exposes.
//!
//! This is the only component that mutates accounts or refresh-token
//! records. The per-account state machine is `Active ⇄ Locked` and
//! `Active → Archived` (terminal); any credential change revokes every
//! outstanding refresh token for the account and, where the flow continues,
//! issues a fresh session.

use chrono::Utc;
use identity_token::Jwks;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::data::accounts::{Account, AccountStore, CreateOutcome};
use crate::data::actives::ActivesTracker;
use crate::data::keys::KeyStore;
use crate::data::kv::Kv;
use crate::data::refresh::RefreshTokenStore;
use crate::domain::match_origin;
use crate::error::{Result, ServiceError};
use crate::password::{PasswordHasher, PasswordPolicy};
use crate::tokens::{ResetIssuer, Session, SessionIssuer};

pub struct AccountService {
    config: Arc<Config>,
    accounts: Arc<dyn AccountStore>,
    keys: Arc<dyn KeyStore>,
    sessions: SessionIssuer,
    resets: ResetIssuer,
    actives: ActivesTracker,
    hasher: PasswordHasher,
    policy: PasswordPolicy,
}

impl AccountService {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        accounts: Arc<dyn AccountStore>,
        kv: Arc<dyn Kv>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        let sessions = SessionIssuer::new(
            keys.clone(),
            RefreshTokenStore::new(kv.clone(), config.refresh_token_ttl),
            config.session_signing_key.clone(),
            config.issuer.clone(),
            config.access_token_ttl,
        );
        let resets = ResetIssuer::new(
            config.reset_signing_key.clone(),
            config.issuer.clone(),
            config.password_reset_token_ttl,
        );
        let actives = ActivesTracker::new(
            kv,
            config.time_zone,
            config.daily_actives_retention,
            config.weekly_actives_retention,
        );
        let hasher = PasswordHasher::new(config.bcrypt_cost);
        let policy = PasswordPolicy::new(config.password_policy_score);
        Self {
            config,
            accounts,
            keys,
            sessions,
            resets,
            actives,
            hasher,
            policy,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve the audience for a request from its `Origin`/`Referer`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownAudience`] when no configured
    /// application domain matches.
    pub fn resolve_audience(&self, origin: Option<&str>) -> Result<String> {
        let origin = origin.ok_or(ServiceError::UnknownAudience)?;
        match_origin(&self.config.app_domains, origin)
            .map(ToString::to_string)
            .ok_or(ServiceError::UnknownAudience)
    }

    /// Register a new account and open its first session.
    ///
    /// # Errors
    ///
    /// `FormatInvalid` for a malformed username, `InsecurePassword` for a
    /// weak password, `Taken` when the username already exists,
    /// `UnknownAudience` when the origin resolves to no application.
    pub async fn signup(&self, username: &str, password: &str, origin: Option<&str>) -> Result<Session> {
        let audience = self.resolve_audience(origin)?;
        let username = username.trim();
        self.validate_username(username)?;
        self.policy.validate(password, &[username])?;

        let password_hash = self.hasher.hash(password).await?;
        let account = match self.accounts.create(username, &password_hash).await? {
            CreateOutcome::Created(account) => account,
            CreateOutcome::Taken => return Err(ServiceError::Taken),
        };

        let session = self.sessions.issue(account.id, &audience).await?;
        self.track_active(account.id).await;
        Ok(session)
    }

    /// Authenticate with username and password.
    ///
    /// A locked account fails exactly like a bad password here, so the
    /// credential path never confirms an account's existence or state.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown usernames, `Failed` for bad credentials or a
    /// locked account, `EXPIRED` (`PasswordExpired`) when a password change
    /// is required, `UnknownAudience` for unresolvable origins.
    pub async fn login(&self, username: &str, password: &str, origin: Option<&str>) -> Result<Session> {
        let audience = self.resolve_audience(origin)?;
        let account = self
            .accounts
            .find_by_username(username.trim())
            .await?
            .ok_or(ServiceError::NotFound)?;
        if account.locked {
            return Err(ServiceError::Failed);
        }

        let check = self.hasher.check(password, &account.password_hash).await?;
        if !check.ok {
            return Err(ServiceError::Failed);
        }
        if account.require_new_password {
            return Err(ServiceError::PasswordExpired);
        }
        if check.needs_upgrade {
            self.upgrade_hash(&account, password).await;
        }

        let session = self.sessions.issue(account.id, &audience).await?;
        self.track_active(account.id).await;
        Ok(session)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// `SessionInvalid` for unknown/revoked tokens, `UnknownAudience` for
    /// unresolvable origins.
    pub async fn refresh(&self, refresh_token: &str, origin: Option<&str>) -> Result<String> {
        let audience = self.resolve_audience(origin)?;
        let (account_id, access_token) = self.sessions.refresh(refresh_token, &audience).await?;
        self.track_active(account_id).await;
        Ok(access_token)
    }

    /// Revoke exactly the presented refresh token. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Backend`] when the store fails.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        self.sessions.revoke(refresh_token).await
    }

    /// Account behind a live session cookie.
    ///
    /// # Errors
    ///
    /// `SessionInvalid` when the token is unknown, expired, or revoked.
    pub async fn authenticate(&self, refresh_token: &str) -> Result<i64> {
        self.sessions.authenticate(refresh_token).await
    }

    /// Change a password, revoking every outstanding session and opening a
    /// fresh one.
    ///
    /// # Errors
    ///
    /// `Failed` when the current password does not match, `Locked` for
    /// locked accounts (this path is authenticated, so the distinction is
    /// not an enumeration leak), `InsecurePassword` for weak replacements.
    pub async fn change_password(
        &self,
        account_id: i64,
        current_password: &str,
        new_password: &str,
        origin: Option<&str>,
    ) -> Result<Session> {
        let audience = self.resolve_audience(origin)?;
        let account = self
            .accounts
            .find(account_id)
            .await?
            .filter(|account| !account.deleted)
            .ok_or(ServiceError::NotFound)?;
        if account.locked {
            return Err(ServiceError::Locked);
        }

        let check = self
            .hasher
            .check(current_password, &account.password_hash)
            .await?;
        if !check.ok {
            return Err(ServiceError::Failed);
        }

        self.set_new_password(&account, new_password).await?;
        let session = self.sessions.issue(account.id, &audience).await?;
        self.track_active(account.id).await;
        Ok(session)
    }

    /// Issue a password-reset token for the account behind `username`.
    ///
    /// The caller forwards the token to the configured webhook; it is never
    /// returned to the requesting client.
    ///
    /// # Errors
    ///
    /// `NotFound` when no live account matches. Locked accounts report
    /// `NotFound` too: this path is unauthenticated.
    pub async fn request_reset(&self, username: &str) -> Result<(i64, String)> {
        let account = self
            .accounts
            .find_by_username(username.trim())
            .await?
            .filter(|account| !account.locked)
            .ok_or(ServiceError::NotFound)?;
        let token = self.resets.issue(account.id, &account.password_hash)?;
        Ok((account.id, token))
    }

    /// Consume a reset token: prove mailbox control, set the new password,
    /// revoke everything outstanding, and open a fresh session.
    ///
    /// # Errors
    ///
    /// `TokenInvalid` for any token problem, including a password change
    /// since issuance; `InsecurePassword` for weak replacements.
    pub async fn consume_reset(
        &self,
        token: &str,
        new_password: &str,
        origin: Option<&str>,
    ) -> Result<Session> {
        let audience = self.resolve_audience(origin)?;
        let claims = self.resets.verify(token)?;
        let account_id: i64 = claims.sub.parse().map_err(|_| ServiceError::TokenInvalid)?;
        let account = self
            .accounts
            .find(account_id)
            .await?
            .filter(|account| !account.deleted && !account.locked)
            .ok_or(ServiceError::TokenInvalid)?;
        // The lock claim pins the token to the password state it was issued
        // against; any change since then leaves the token inert.
        if claims.lock != ResetIssuer::lock_digest(&account.password_hash) {
            return Err(ServiceError::TokenInvalid);
        }

        self.set_new_password(&account, new_password).await?;
        let session = self.sessions.issue(account.id, &audience).await?;
        self.track_active(account.id).await;
        Ok(session)
    }

    /// Administrative lookup.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub async fn account(&self, account_id: i64) -> Result<Account> {
        self.accounts
            .find(account_id)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    /// Lock an account and revoke its sessions.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or archived ids.
    pub async fn lock(&self, account_id: i64) -> Result<()> {
        if !self.accounts.set_locked(account_id, true).await? {
            return Err(ServiceError::NotFound);
        }
        // Locked accounts cannot authenticate, which includes refreshing.
        self.sessions.revoke_all(account_id).await?;
        Ok(())
    }

    /// Unlock an account.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or archived ids.
    pub async fn unlock(&self, account_id: i64) -> Result<()> {
        if !self.accounts.set_locked(account_id, false).await? {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    }

    /// Archive an account: revoke everything, zero the credentials,
    /// soft-delete. Terminal.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or already-archived ids.
    pub async fn archive(&self, account_id: i64) -> Result<()> {
        self.sessions.revoke_all(account_id).await?;
        if !self.accounts.archive(account_id).await? {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    }

    /// Force a password change on the account's next successful login.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or archived ids.
    pub async fn require_new_password(&self, account_id: i64) -> Result<()> {
        if !self.accounts.require_new_password(account_id).await? {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    }

    /// Published verification keys.
    ///
    /// # Errors
    ///
    /// `Backend` when the key store is unavailable.
    pub async fn jwks(&self) -> Result<Jwks> {
        Ok(self.keys.keys().await?)
    }

    /// Distinct active accounts per day.
    ///
    /// # Errors
    ///
    /// `Backend` when the store is unavailable.
    pub async fn daily_actives(&self) -> Result<std::collections::BTreeMap<String, u64>> {
        Ok(self.actives.daily().await?)
    }

    /// Distinct active accounts per ISO week.
    ///
    /// # Errors
    ///
    /// `Backend` when the store is unavailable.
    pub async fn weekly_actives(&self) -> Result<std::collections::BTreeMap<String, u64>> {
        Ok(self.actives.weekly().await?)
    }

    fn validate_username(&self, username: &str) -> Result<()> {
        if username.chars().count() < self.config.username_min_length {
            return Err(ServiceError::FormatInvalid);
        }
        if self.config.username_is_email {
            if !valid_email(username) {
                return Err(ServiceError::FormatInvalid);
            }
            if !self.config.email_username_domains.is_empty() {
                let domain = username
                    .rsplit_once('@')
                    .map(|(_, domain)| domain.to_lowercase())
                    .unwrap_or_default();
                if !self.config.email_username_domains.contains(&domain) {
                    return Err(ServiceError::FormatInvalid);
                }
            }
        }
        Ok(())
    }

    async fn set_new_password(&self, account: &Account, new_password: &str) -> Result<()> {
        self.policy
            .validate(new_password, &[account.username.as_str()])?;
        let password_hash = self.hasher.hash(new_password).await?;
        if !self.accounts.set_password(account.id, &password_hash).await? {
            return Err(ServiceError::NotFound);
        }
        self.sessions.revoke_all(account.id).await?;
        Ok(())
    }

    async fn upgrade_hash(&self, account: &Account, password: &str) {
        // Hash upgrades are best-effort: a store hiccup here must not fail
        // an otherwise successful login.
        let rehash = match self.hasher.hash(password).await {
            Ok(rehash) => rehash,
            Err(err) => {
                warn!(account_id = account.id, "password rehash failed: {err:#}");
                return;
            }
        };
        match self.accounts.set_password(account.id, &rehash).await {
            Ok(true) => {}
            Ok(false) => warn!(account_id = account.id, "password upgrade lost the account"),
            Err(err) => warn!(account_id = account.id, "password upgrade failed: {err:#}"),
        }
    }

    async fn track_active(&self, account_id: i64) {
        // Cohort tracking is observability, not part of the credential
        // contract; failures are logged and swallowed.
        if let Err(err) = self.actives.track(account_id, Utc::now()).await {
            warn!(account_id, "failed to track active account: {err:#}");
        }
    }
}

fn valid_email(username: &str) -> bool {
    use regex::Regex;
    use std::sync::OnceLock;
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL
        .get_or_init(|| {
            Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap_or_else(|_| {
                unreachable!("email pattern is a valid regex")
            })
        })
        .is_match(username)
}
