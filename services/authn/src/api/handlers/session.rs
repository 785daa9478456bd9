//! Login, logout, and access-token refresh.

use axum::{
    Json,
    extract::{Extension, Form},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use super::{
    accounts::Credentials, clear_session_cookie, extract_session_token, request_origin,
    session_response,
};
use crate::error::ServiceError;
use crate::service::AccountService;

#[utoipa::path(
    post,
    path = "/session",
    request_body(content = Credentials, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Authenticated; session cookie set, access token in body"),
        (status = 401, description = "Credentials did not match"),
        (status = 403, description = "Request origin matches no configured application domain"),
        (status = 404, description = "Unknown username"),
    ),
    tag = "session"
)]
pub async fn login(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Form(credentials): Form<Credentials>,
) -> Result<Response, ServiceError> {
    let origin = request_origin(&headers);
    let session = service
        .login(&credentials.username, &credentials.password, origin.as_deref())
        .await?;
    session_response(service.config(), &session, StatusCode::CREATED)
}

#[utoipa::path(
    delete,
    path = "/session",
    responses(
        (status = 200, description = "Session revoked and cookie cleared"),
    ),
    tag = "session"
)]
pub async fn logout(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
) -> Response {
    let cookie_name = service.config().session_cookie_name.clone();
    if let Some(token) = extract_session_token(&headers, &cookie_name) {
        if let Err(err) = service.logout(&token).await {
            error!("failed to revoke session: {err:#}");
        }
    }

    // Clear the cookie regardless; logout is idempotent.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(service.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::OK, response_headers).into_response()
}

#[utoipa::path(
    get,
    path = "/session/refresh",
    responses(
        (status = 201, description = "New access token in body"),
        (status = 401, description = "Session is missing, expired, or revoked"),
        (status = 403, description = "Request origin matches no configured application domain"),
    ),
    tag = "session"
)]
pub async fn refresh(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let cookie_name = service.config().session_cookie_name.clone();
    let token =
        extract_session_token(&headers, &cookie_name).ok_or(ServiceError::SessionInvalid)?;
    let origin = request_origin(&headers);
    let access_token = service.refresh(&token, origin.as_deref()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "result": { "id_token": access_token } })),
    )
        .into_response())
}
