//! HTTP handlers and the helpers they share.

pub mod accounts;
pub mod admin;
pub mod health;
pub mod jwks;
pub mod password;
pub mod session;

use axum::{
    Json,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, InvalidHeaderValue, ORIGIN, REFERER, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;

use crate::config::Config;
use crate::error::ServiceError;
use crate::tokens::Session;

/// Build the `Set-Cookie` header carrying a refresh token.
///
/// HttpOnly and SameSite=Lax always; Secure only when the service itself is
/// served over https. The cookie lives exactly as long as the refresh token.
pub(crate) fn session_cookie(
    config: &Config,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={token}; Path={}; HttpOnly; SameSite=Lax; Max-Age={}",
        config.session_cookie_name,
        config.cookie_path(),
        config.refresh_token_ttl.as_secs()
    );
    if config.force_ssl {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(config: &Config) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}=; Path={}; HttpOnly; SameSite=Lax; Max-Age=0",
        config.session_cookie_name,
        config.cookie_path()
    );
    if config.force_ssl {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Pull the refresh token out of the session cookie, if present.
pub(crate) fn extract_session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == cookie_name && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

/// Referring origin for audience resolution: `Origin` first, `Referer` as
/// the fallback for plain navigations.
pub(crate) fn request_origin(headers: &HeaderMap) -> Option<String> {
    for header in [ORIGIN, REFERER] {
        if let Some(value) = headers.get(&header).and_then(|value| value.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() && trimmed != "null" {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Session success payload: the access token in the body, the refresh token
/// in the cookie.
pub(crate) fn session_response(
    config: &Config,
    session: &Session,
    status: StatusCode,
) -> Result<Response, ServiceError> {
    let cookie = session_cookie(config, &session.refresh_token).map_err(|err| {
        ServiceError::Backend(anyhow::anyhow!("failed to build session cookie: {err}"))
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, cookie);
    let body = Json(json!({ "result": { "id_token": session.access_token } }));
    Ok((status, headers, body).into_response())
}

/// Gate an admin route behind HTTP basic auth.
pub(crate) fn require_admin(headers: &HeaderMap, config: &Config) -> Result<(), Response> {
    let unauthorized = || {
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            axum::http::header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"authn\""),
        );
        (StatusCode::UNAUTHORIZED, response_headers).into_response()
    };

    let Some(value) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) else {
        return Err(unauthorized());
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return Err(unauthorized());
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return Err(unauthorized());
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return Err(unauthorized());
    };
    let Some((username, password)) = decoded.split_once(':') else {
        return Err(unauthorized());
    };
    if username != config.http_auth_username || password != config.http_auth_password {
        return Err(unauthorized());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AppDomain;
    use chrono_tz::Tz;
    use std::time::Duration;
    use url::Url;

    fn config() -> Config {
        Config {
            app_domains: vec![AppDomain::parse("a.com")],
            authn_url: Url::parse("https://authn.example.test/authn").expect("valid url"),
            issuer: "https://authn.example.test/authn".to_string(),
            mounted_path: "/authn".to_string(),
            force_ssl: true,
            session_signing_key: b"session".to_vec(),
            reset_signing_key: b"reset".to_vec(),
            db_encryption_key: [0u8; 32],
            bcrypt_cost: 10,
            password_policy_score: 2,
            database_url: String::new(),
            redis_url: String::new(),
            username_is_email: false,
            username_min_length: 3,
            email_username_domains: Vec::new(),
            enable_signup: true,
            refresh_token_ttl: Duration::from_secs(300),
            access_token_ttl: Duration::from_secs(60),
            password_reset_token_ttl: Duration::from_secs(60),
            identity_key_rotation_interval: Duration::from_secs(60),
            http_auth_username: "admin".to_string(),
            http_auth_password: "hunter2".to_string(),
            app_password_reset_url: None,
            rsa_private_key: None,
            time_zone: Tz::UTC,
            daily_actives_retention: 30,
            weekly_actives_retention: 52,
            session_cookie_name: "authn".to_string(),
        }
    }

    #[test]
    fn session_cookie_carries_the_policy_attributes() {
        let cookie = session_cookie(&config(), "tok").expect("valid header");
        let cookie = cookie.to_str().expect("ascii");
        assert!(cookie.starts_with("authn=tok; "));
        assert!(cookie.contains("Path=/authn"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=300"));
        assert!(cookie.ends_with("Secure"));
    }

    #[test]
    fn insecure_deployment_omits_secure_attribute() {
        let mut config = config();
        config.force_ssl = false;
        let cookie = session_cookie(&config, "tok").expect("valid header");
        assert!(!cookie.to_str().expect("ascii").contains("Secure"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let cookie = clear_session_cookie(&config()).expect("valid header");
        let cookie = cookie.to_str().expect("ascii");
        assert!(cookie.starts_with("authn=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn session_token_extraction_by_name() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("other=1; authn=the-token; theme=dark"),
        );
        assert_eq!(
            extract_session_token(&headers, "authn"),
            Some("the-token".to_string())
        );
        assert_eq!(extract_session_token(&headers, "missing"), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("authn="),
        );
        assert_eq!(extract_session_token(&headers, "authn"), None);
    }

    #[test]
    fn origin_prefers_origin_over_referer() {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static("https://a.com/page"));
        assert_eq!(
            request_origin(&headers),
            Some("https://a.com/page".to_string())
        );

        headers.insert(ORIGIN, HeaderValue::from_static("https://b.com"));
        assert_eq!(request_origin(&headers), Some("https://b.com".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static("null"));
        assert_eq!(request_origin(&headers), None);
    }

    #[test]
    fn basic_auth_is_checked() {
        let config = config();

        let mut headers = HeaderMap::new();
        assert!(require_admin(&headers, &config).is_err());

        // admin:hunter2
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Basic YWRtaW46aHVudGVyMg=="),
        );
        assert!(require_admin(&headers, &config).is_ok());

        // admin:wrong
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Basic YWRtaW46d3Jvbmc="),
        );
        assert!(require_admin(&headers, &config).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        assert!(require_admin(&headers, &config).is_err());
    }
}
