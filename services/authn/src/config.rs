//! Service configuration.
//!
//! Configuration is resolved once at startup from the environment and passed
//! around as an immutable value. Loading runs an ordered list of configurers
//! against a builder so that derived values (the secret key base must be
//! stretched before anything consumes the derived keys, the rotation interval
//! defaults to the access-token TTL) are produced in dependency order.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono_tz::Tz;
use pbkdf2::pbkdf2_hmac;
use rand::{RngCore, rngs::OsRng};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::time::Duration;
use url::Url;

use crate::domain::AppDomain;

const KEY_DERIVATION_ITERATIONS: u32 = 20_000;
const DERIVED_KEY_BYTES: usize = 64;

const DEFAULT_BCRYPT_COST: u32 = 11;
const DEFAULT_PASSWORD_POLICY_SCORE: u8 = 2;
const DEFAULT_USERNAME_MIN_LENGTH: usize = 3;
const DEFAULT_REFRESH_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;
const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 60 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECS: u64 = 30 * 60;
const DEFAULT_DAILY_ACTIVES_RETENTION: usize = 365;
const DEFAULT_WEEKLY_ACTIVES_RETENTION: usize = 104;
const DEFAULT_SESSION_COOKIE_NAME: &str = "authn";

#[derive(Clone, Debug)]
pub struct Config {
    pub app_domains: Vec<AppDomain>,
    pub authn_url: Url,
    /// Issuer string for signed tokens; also the JWKS discovery base.
    pub issuer: String,
    /// Path under which all routes are mounted, from the `AUTHN_URL` path.
    pub mounted_path: String,
    pub force_ssl: bool,
    pub session_signing_key: Vec<u8>,
    pub reset_signing_key: Vec<u8>,
    pub db_encryption_key: [u8; 32],
    pub bcrypt_cost: u32,
    pub password_policy_score: u8,
    pub database_url: String,
    pub redis_url: String,
    pub username_is_email: bool,
    pub username_min_length: usize,
    pub email_username_domains: Vec<String>,
    pub enable_signup: bool,
    pub refresh_token_ttl: Duration,
    pub access_token_ttl: Duration,
    pub password_reset_token_ttl: Duration,
    pub identity_key_rotation_interval: Duration,
    pub http_auth_username: String,
    pub http_auth_password: String,
    pub app_password_reset_url: Option<Url>,
    pub rsa_private_key: Option<RsaPrivateKey>,
    pub time_zone: Tz,
    pub daily_actives_retention: usize,
    pub weekly_actives_retention: usize,
    pub session_cookie_name: String,
}

impl Config {
    /// Resolve the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a value fails
    /// validation (for example a bcrypt cost below 10).
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::default();
        for configurer in CONFIGURERS {
            configurer(&mut builder)?;
        }
        builder.build()
    }

    /// Cookie path: the mounted path, or `/` when mounted at the root.
    #[must_use]
    pub fn cookie_path(&self) -> &str {
        if self.mounted_path.is_empty() {
            "/"
        } else {
            &self.mounted_path
        }
    }
}

#[derive(Default)]
struct ConfigBuilder {
    app_domains: Option<Vec<AppDomain>>,
    authn_url: Option<Url>,
    session_signing_key: Option<Vec<u8>>,
    reset_signing_key: Option<Vec<u8>>,
    db_encryption_key: Option<[u8; 32]>,
    bcrypt_cost: Option<u32>,
    password_policy_score: Option<u8>,
    database_url: Option<String>,
    redis_url: Option<String>,
    username_is_email: bool,
    username_min_length: Option<usize>,
    email_username_domains: Vec<String>,
    enable_signup: Option<bool>,
    refresh_token_ttl: Option<Duration>,
    access_token_ttl: Option<Duration>,
    password_reset_token_ttl: Option<Duration>,
    identity_key_rotation_interval: Option<Duration>,
    http_auth_username: Option<String>,
    http_auth_password: Option<String>,
    app_password_reset_url: Option<Url>,
    rsa_private_key: Option<RsaPrivateKey>,
    time_zone: Option<Tz>,
    daily_actives_retention: Option<usize>,
    weekly_actives_retention: Option<usize>,
    session_cookie_name: Option<String>,
}

impl ConfigBuilder {
    fn build(self) -> Result<Config> {
        let authn_url = self
            .authn_url
            .ok_or_else(|| anyhow!("AUTHN_URL is required"))?;
        let mounted_path = authn_url.path().trim_end_matches('/').to_string();
        let force_ssl = authn_url.scheme() == "https";
        let issuer = authn_url.as_str().trim_end_matches('/').to_string();
        let access_token_ttl = self
            .access_token_ttl
            .unwrap_or(Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECS));

        Ok(Config {
            app_domains: self
                .app_domains
                .ok_or_else(|| anyhow!("APP_DOMAINS is required"))?,
            authn_url,
            issuer,
            mounted_path,
            force_ssl,
            session_signing_key: self
                .session_signing_key
                .ok_or_else(|| anyhow!("SECRET_KEY_BASE is required"))?,
            reset_signing_key: self
                .reset_signing_key
                .ok_or_else(|| anyhow!("SECRET_KEY_BASE is required"))?,
            db_encryption_key: self
                .db_encryption_key
                .ok_or_else(|| anyhow!("SECRET_KEY_BASE is required"))?,
            bcrypt_cost: self.bcrypt_cost.unwrap_or(DEFAULT_BCRYPT_COST),
            password_policy_score: self
                .password_policy_score
                .unwrap_or(DEFAULT_PASSWORD_POLICY_SCORE),
            database_url: self
                .database_url
                .ok_or_else(|| anyhow!("DATABASE_URL is required"))?,
            redis_url: self
                .redis_url
                .ok_or_else(|| anyhow!("REDIS_URL is required"))?,
            username_is_email: self.username_is_email,
            username_min_length: self
                .username_min_length
                .unwrap_or(DEFAULT_USERNAME_MIN_LENGTH),
            email_username_domains: self.email_username_domains,
            enable_signup: self.enable_signup.unwrap_or(true),
            refresh_token_ttl: self
                .refresh_token_ttl
                .unwrap_or(Duration::from_secs(DEFAULT_REFRESH_TOKEN_TTL_SECS)),
            access_token_ttl,
            password_reset_token_ttl: self
                .password_reset_token_ttl
                .unwrap_or(Duration::from_secs(DEFAULT_RESET_TOKEN_TTL_SECS)),
            // Prior keys are retained for one access-token TTL after demotion,
            // so any interval >= the access TTL keeps outstanding tokens verifiable.
            identity_key_rotation_interval: self
                .identity_key_rotation_interval
                .unwrap_or(access_token_ttl),
            http_auth_username: self.http_auth_username.unwrap_or_else(random_credential),
            http_auth_password: self.http_auth_password.unwrap_or_else(random_credential),
            app_password_reset_url: self.app_password_reset_url,
            rsa_private_key: self.rsa_private_key,
            time_zone: self.time_zone.unwrap_or(Tz::UTC),
            daily_actives_retention: self
                .daily_actives_retention
                .unwrap_or(DEFAULT_DAILY_ACTIVES_RETENTION),
            weekly_actives_retention: self
                .weekly_actives_retention
                .unwrap_or(DEFAULT_WEEKLY_ACTIVES_RETENTION),
            session_cookie_name: self
                .session_cookie_name
                .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_NAME.to_string()),
        })
    }
}

type Configurer = fn(&mut ConfigBuilder) -> Result<()>;

/// Ordered loaders. Later entries may depend on earlier ones, so the order is
/// part of the contract: the secret key base is stretched before any consumer
/// runs, and the rotation-interval default reads the access-token TTL.
const CONFIGURERS: &[Configurer] = &[
    // APP_DOMAINS: comma-separated referrer/audience allowlist. A domain with
    // a port matches only that port; without one it matches any port.
    |builder| {
        let val = require_env("APP_DOMAINS")?;
        builder.app_domains = Some(val.split(',').map(AppDomain::parse).collect());
        Ok(())
    },
    // AUTHN_URL: token issuer, JWKS base, and mount path. An https scheme
    // turns on the Secure cookie attribute.
    |builder| {
        let val = require_env("AUTHN_URL")?;
        let url = Url::parse(&val).with_context(|| format!("invalid AUTHN_URL: {val}"))?;
        if url.host_str().is_none() {
            bail!("AUTHN_URL must include a host: {val}");
        }
        builder.authn_url = Some(url);
        Ok(())
    },
    // SECRET_KEY_BASE: seed for the session, reset, and database-encryption
    // keys. The stretch (PBKDF2-HMAC-SHA256, 20k iterations) keeps a leaked
    // signature from turning into a cheap search for the base secret, and
    // isolates the derived keys from each other.
    |builder| {
        let val = require_env("SECRET_KEY_BASE")?;
        builder.session_signing_key = Some(derive_key(val.as_bytes(), "session-key-salt").to_vec());
        builder.reset_signing_key =
            Some(derive_key(val.as_bytes(), "password-reset-token-key-salt").to_vec());
        let db = derive_key(val.as_bytes(), "db-encryption-key-salt");
        let mut db_key = [0u8; 32];
        db_key.copy_from_slice(&db[..32]);
        builder.db_encryption_key = Some(db_key);
        Ok(())
    },
    // BCRYPT_COST: work factor for password hashing. Below 10 is refused.
    |builder| {
        if let Some(val) = lookup_env("BCRYPT_COST") {
            let cost: u32 = val
                .parse()
                .with_context(|| format!("invalid BCRYPT_COST: {val}"))?;
            if cost < 10 {
                bail!("BCRYPT_COST is too low: {cost}");
            }
            builder.bcrypt_cost = Some(cost);
        }
        Ok(())
    },
    // PASSWORD_POLICY_SCORE: minimum zxcvbn score accepted at signup and
    // password change.
    |builder| {
        if let Some(val) = lookup_env("PASSWORD_POLICY_SCORE") {
            builder.password_policy_score = Some(
                val.parse()
                    .with_context(|| format!("invalid PASSWORD_POLICY_SCORE: {val}"))?,
            );
        }
        Ok(())
    },
    |builder| {
        builder.database_url = Some(require_env("DATABASE_URL")?);
        Ok(())
    },
    |builder| {
        builder.redis_url = Some(require_env("REDIS_URL")?);
        Ok(())
    },
    // USERNAME_IS_EMAIL plus EMAIL_USERNAME_DOMAINS: email-shaped usernames,
    // optionally restricted to an allowlist of mail domains at signup.
    |builder| {
        builder.username_is_email = lookup_bool("USERNAME_IS_EMAIL")?;
        if let Some(val) = lookup_env("EMAIL_USERNAME_DOMAINS") {
            builder.email_username_domains = val
                .split(',')
                .map(|domain| domain.trim().to_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect();
        }
        if let Some(val) = lookup_env("USERNAME_MIN_LENGTH") {
            builder.username_min_length = Some(
                val.parse()
                    .with_context(|| format!("invalid USERNAME_MIN_LENGTH: {val}"))?,
            );
        }
        Ok(())
    },
    |builder| {
        if lookup_env("ENABLE_SIGNUP").is_some() {
            builder.enable_signup = Some(lookup_bool("ENABLE_SIGNUP")?);
        }
        Ok(())
    },
    |builder| {
        builder.refresh_token_ttl = lookup_secs("REFRESH_TOKEN_TTL")?;
        builder.access_token_ttl = lookup_secs("ACCESS_TOKEN_TTL")?;
        builder.password_reset_token_ttl = lookup_secs("PASSWORD_RESET_TOKEN_TTL")?;
        Ok(())
    },
    // IDENTITY_KEY_ROTATION_INTERVAL: how long a key stays current. Defaults
    // to the access-token TTL (resolved in build(), after the TTL loader).
    |builder| {
        builder.identity_key_rotation_interval = lookup_secs("IDENTITY_KEY_ROTATION_INTERVAL")?;
        Ok(())
    },
    // HTTP_AUTH_USERNAME / HTTP_AUTH_PASSWORD: basic auth for admin routes.
    // Left unset, both are randomized so the routes exist but are unreachable
    // until credentials are configured deliberately.
    |builder| {
        builder.http_auth_username = lookup_env("HTTP_AUTH_USERNAME");
        builder.http_auth_password = lookup_env("HTTP_AUTH_PASSWORD");
        Ok(())
    },
    |builder| {
        if let Some(val) = lookup_env("APP_PASSWORD_RESET_URL") {
            builder.app_password_reset_url = Some(
                Url::parse(&val).with_context(|| format!("invalid APP_PASSWORD_RESET_URL: {val}"))?,
            );
        }
        Ok(())
    },
    // RSA_PRIVATE_KEY: static identity key. Providing one disables rotation.
    |builder| {
        if let Some(val) = lookup_env("RSA_PRIVATE_KEY") {
            let key = identity_token::parse_rsa_private_key(val.as_bytes())
                .map_err(|err| anyhow!("invalid RSA_PRIVATE_KEY: {err}"))?;
            builder.rsa_private_key = Some(key);
        }
        Ok(())
    },
    // TIME_ZONE: IANA zone for actives bucketing, DST transitions included.
    |builder| {
        if let Some(val) = lookup_env("TIME_ZONE") {
            builder.time_zone = Some(
                val.parse::<Tz>()
                    .map_err(|err| anyhow!("invalid TIME_ZONE: {err}"))?,
            );
        }
        Ok(())
    },
    |builder| {
        if let Some(val) = lookup_env("DAILY_ACTIVES_RETENTION") {
            builder.daily_actives_retention = Some(
                val.parse()
                    .with_context(|| format!("invalid DAILY_ACTIVES_RETENTION: {val}"))?,
            );
        }
        if let Some(val) = lookup_env("WEEKLY_ACTIVES_RETENTION") {
            builder.weekly_actives_retention = Some(
                val.parse()
                    .with_context(|| format!("invalid WEEKLY_ACTIVES_RETENTION: {val}"))?,
            );
        }
        Ok(())
    },
    |builder| {
        builder.session_cookie_name = lookup_env("SESSION_COOKIE_NAME");
        Ok(())
    },
];

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("{name} is required"))
}

fn lookup_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|val| !val.is_empty())
}

fn lookup_bool(name: &str) -> Result<bool> {
    match lookup_env(name).as_deref() {
        None => Ok(false),
        Some("true" | "t" | "1") => Ok(true),
        Some("false" | "f" | "0") => Ok(false),
        Some(other) => Err(anyhow!("invalid boolean for {name}: {other}")),
    }
}

fn lookup_secs(name: &str) -> Result<Option<Duration>> {
    match lookup_env(name) {
        None => Ok(None),
        Some(val) => {
            let secs: u64 = val
                .parse()
                .with_context(|| format!("invalid seconds value for {name}: {val}"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
    }
}

fn derive_key(base: &[u8], salt: &str) -> [u8; DERIVED_KEY_BYTES] {
    let mut out = [0u8; DERIVED_KEY_BYTES];
    pbkdf2_hmac::<Sha256>(base, salt.as_bytes(), KEY_DERIVATION_ITERATIONS, &mut out);
    out
}

fn random_credential() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required_vars() -> Vec<(&'static str, Option<&'static str>)> {
        vec![
            ("APP_DOMAINS", Some("a.com,b.com:8443")),
            ("AUTHN_URL", Some("https://authn.example.com/authn")),
            ("SECRET_KEY_BASE", Some("test-secret-key-base")),
            ("DATABASE_URL", Some("postgres://localhost:5432/authn")),
            ("REDIS_URL", Some("redis://localhost:6379/0")),
        ]
    }

    #[test]
    fn builds_with_defaults() {
        temp_env::with_vars(required_vars(), || {
            let config = Config::from_env().expect("config should build");
            assert_eq!(config.app_domains.len(), 2);
            assert_eq!(config.issuer, "https://authn.example.com/authn");
            assert_eq!(config.mounted_path, "/authn");
            assert!(config.force_ssl);
            assert_eq!(config.bcrypt_cost, 11);
            assert_eq!(config.password_policy_score, 2);
            assert_eq!(config.username_min_length, 3);
            assert!(config.enable_signup);
            assert_eq!(config.access_token_ttl, Duration::from_secs(3600));
            assert_eq!(
                config.refresh_token_ttl,
                Duration::from_secs(365 * 24 * 60 * 60)
            );
            assert_eq!(config.password_reset_token_ttl, Duration::from_secs(1800));
            // Rotation interval defaults to the access-token TTL.
            assert_eq!(config.identity_key_rotation_interval, config.access_token_ttl);
            assert_eq!(config.session_cookie_name, "authn");
            assert_eq!(config.time_zone, Tz::UTC);
            assert_eq!(config.daily_actives_retention, 365);
            assert_eq!(config.weekly_actives_retention, 104);
            assert!(config.rsa_private_key.is_none());
            assert!(!config.http_auth_username.is_empty());
            assert!(!config.http_auth_password.is_empty());
        });
    }

    #[test]
    fn derived_keys_are_deterministic_and_distinct() {
        let first = temp_env::with_vars(required_vars(), || {
            Config::from_env().expect("config should build")
        });
        let second = temp_env::with_vars(required_vars(), || {
            Config::from_env().expect("config should build")
        });
        assert_eq!(first.session_signing_key, second.session_signing_key);
        assert_eq!(first.reset_signing_key, second.reset_signing_key);
        assert_eq!(first.db_encryption_key, second.db_encryption_key);
        assert_eq!(first.session_signing_key.len(), 64);
        assert_ne!(first.session_signing_key, first.reset_signing_key);
        assert_ne!(
            &first.session_signing_key[..32],
            first.db_encryption_key.as_slice()
        );
    }

    #[test]
    fn missing_required_variable_fails() {
        let mut vars = required_vars();
        vars[1] = ("AUTHN_URL", None);
        temp_env::with_vars(vars, || {
            let err = Config::from_env().expect_err("should fail without AUTHN_URL");
            assert!(err.to_string().contains("AUTHN_URL"));
        });
    }

    #[test]
    fn bcrypt_cost_floor_is_enforced() {
        let mut vars = required_vars();
        vars.push(("BCRYPT_COST", Some("9")));
        temp_env::with_vars(vars, || {
            let err = Config::from_env().expect_err("cost 9 should be refused");
            assert!(err.to_string().contains("BCRYPT_COST"));
        });
    }

    #[test]
    fn overrides_are_applied() {
        let mut vars = required_vars();
        vars.extend([
            ("BCRYPT_COST", Some("12")),
            ("PASSWORD_POLICY_SCORE", Some("3")),
            ("ACCESS_TOKEN_TTL", Some("600")),
            ("IDENTITY_KEY_ROTATION_INTERVAL", Some("1200")),
            ("ENABLE_SIGNUP", Some("false")),
            ("USERNAME_IS_EMAIL", Some("true")),
            ("EMAIL_USERNAME_DOMAINS", Some("Example.com, corp.test")),
            ("SESSION_COOKIE_NAME", Some("identity")),
            ("HTTP_AUTH_USERNAME", Some("admin")),
            ("HTTP_AUTH_PASSWORD", Some("hunter2")),
            ("TIME_ZONE", Some("America/Chicago")),
        ]);
        temp_env::with_vars(vars, || {
            let config = Config::from_env().expect("config should build");
            assert_eq!(config.bcrypt_cost, 12);
            assert_eq!(config.password_policy_score, 3);
            assert_eq!(config.access_token_ttl, Duration::from_secs(600));
            assert_eq!(
                config.identity_key_rotation_interval,
                Duration::from_secs(1200)
            );
            assert!(!config.enable_signup);
            assert!(config.username_is_email);
            assert_eq!(
                config.email_username_domains,
                vec!["example.com".to_string(), "corp.test".to_string()]
            );
            assert_eq!(config.session_cookie_name, "identity");
            assert_eq!(config.http_auth_username, "admin");
            assert_eq!(config.http_auth_password, "hunter2");
            assert_eq!(config.time_zone, Tz::America__Chicago);
        });
    }

    #[test]
    fn mount_at_root_keeps_cookie_path_slash() {
        let mut vars = required_vars();
        vars[1] = ("AUTHN_URL", Some("http://authn.internal"));
        temp_env::with_vars(vars, || {
            let config = Config::from_env().expect("config should build");
            assert_eq!(config.mounted_path, "");
            assert_eq!(config.cookie_path(), "/");
            assert_eq!(config.issuer, "http://authn.internal");
            assert!(!config.force_ssl);
        });
    }

    #[test]
    fn time_zone_must_be_a_real_iana_name() {
        let mut vars = required_vars();
        vars.push(("TIME_ZONE", Some("Neither/AZone")));
        temp_env::with_vars(vars, || {
            let err = Config::from_env().expect_err("bogus zone should be refused");
            assert!(err.to_string().contains("TIME_ZONE"));
        });
    }
}
