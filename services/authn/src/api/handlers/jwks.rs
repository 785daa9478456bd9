//! Published verification keys.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderValue, StatusCode, header::CACHE_CONTROL},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::ServiceError;
use crate::service::AccountService;

#[utoipa::path(
    get,
    path = "/jwks",
    responses(
        (status = 200, description = "JWKS document with every currently-trusted identity key", body = String, content_type = "application/json"),
    ),
    tag = "jwks"
)]
pub async fn jwks(
    Extension(service): Extension<Arc<AccountService>>,
) -> Result<Response, ServiceError> {
    let jwks = service.jwks().await?;
    // Consumers may cache briefly, but must re-fetch often enough to pick up
    // a rotation within the access-token lifetime.
    let mut response = (StatusCode::OK, Json(jwks)).into_response();
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("max-age=300, public"),
    );
    Ok(response)
}
