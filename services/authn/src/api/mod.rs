//! HTTP surface: router assembly and server startup.

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

use crate::config::Config;
use crate::data::accounts::{AccountStore, PgAccountStore};
use crate::data::keys::{KeyStore, RotatingKeyStore, StaticKeyStore, spawn_rotation_worker};
use crate::data::kv::{Kv, RedisKv};
use crate::domain::match_origin;
use crate::service::AccountService;
use crate::webhook::ResetWebhook;

pub(crate) mod handlers;
mod openapi;

pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Connect the backing stores, wire the service, and serve until shutdown.
///
/// # Errors
///
/// Returns an error when a backing store is unreachable at startup or the
/// listener cannot bind.
pub async fn serve(port: u16, config: Arc<Config>) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let kv: Arc<dyn Kv> = Arc::new(RedisKv::connect(&config.redis_url).await?);

    let keys: Arc<dyn KeyStore> = match &config.rsa_private_key {
        Some(private_key) => Arc::new(StaticKeyStore::new(private_key.clone())),
        None => {
            let store = Arc::new(RotatingKeyStore::new(
                kv.clone(),
                &config.db_encryption_key,
                config.identity_key_rotation_interval,
                config.access_token_ttl,
            ));
            // Ensure a key exists before the first request needs one;
            // startup is the fatal place for key derivation problems.
            store
                .current()
                .await
                .context("failed to establish an identity key")?;
            let period =
                Duration::from_secs((config.identity_key_rotation_interval.as_secs() / 4).clamp(10, 300));
            spawn_rotation_worker(store.clone(), period);
            store
        }
    };

    let accounts: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(pool.clone()));
    let service = Arc::new(AccountService::new(
        config.clone(),
        accounts,
        kv,
        keys,
    ));
    let webhook = Arc::new(ResetWebhook::new(config.app_password_reset_url.clone())?);

    // Browsers talk to this service from the application domains, with
    // cookies; CORS admits exactly the configured audience list.
    let cors_domains = config.app_domains.clone();
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::PATCH])
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .is_ok_and(|origin| match_origin(&cors_domains, origin).is_some())
        }))
        .allow_credentials(true);

    let (router, _openapi) = router().split_for_parts();
    let app = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(Extension(service))
            .layer(Extension(config.clone()))
            .layer(Extension(webhook))
            .layer(Extension(pool)),
    );

    // Honor the mount path from AUTHN_URL so cookies and routes agree.
    let app = if config.mounted_path.is_empty() {
        app
    } else {
        Router::new().nest(&config.mounted_path, app)
    };

    let listener = TcpListener::bind(format!("::0:{port}")).await?;
    info!("Listening on [::]:{port}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
