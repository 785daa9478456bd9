//! Application domains and audience resolution.
//!
//! Configured domains may refer traffic and become JWT audiences. A domain
//! with a port only matches that exact port; a domain without a port matches
//! any port. Origins without an explicit port get the scheme default (80/443)
//! before comparison.

use std::fmt;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDomain {
    host: String,
    port: Option<u16>,
}

impl AppDomain {
    /// Parse a configured domain of the form `host` or `host:port`.
    ///
    /// An unparsable port is kept as part of the host so the domain simply
    /// never matches, rather than silently widening to all ports.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if let Some((host, port)) = trimmed.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Self {
                    host: host.to_lowercase(),
                    port: Some(port),
                };
            }
        }
        Self {
            host: trimmed.to_lowercase(),
            port: None,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        if self.host != host.to_lowercase() {
            return false;
        }
        match self.port {
            None => true,
            Some(expected) => port == Some(expected),
        }
    }
}

impl fmt::Display for AppDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// Select the configured domain matching a referring origin.
///
/// `origin` accepts an `Origin`/`Referer` header value (full URL) or a bare
/// `host[:port]`. Returns `None` when nothing matches.
#[must_use]
pub fn match_origin<'a>(domains: &'a [AppDomain], origin: &str) -> Option<&'a AppDomain> {
    let trimmed = origin.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default();
    domains.iter().find(|domain| domain.matches(host, port))
}
