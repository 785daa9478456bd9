//! Signup endpoint.

use axum::{
    extract::{Extension, Form},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{request_origin, session_response};
use crate::error::ServiceError;
use crate::service::AccountService;

#[derive(Debug, Deserialize, ToSchema)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/accounts",
    request_body(content = Credentials, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Account created; session cookie set, access token in body"),
        (status = 403, description = "Request origin matches no configured application domain"),
        (status = 404, description = "Signup is disabled"),
        (status = 422, description = "Username or password rejected"),
    ),
    tag = "accounts"
)]
pub async fn signup(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Form(credentials): Form<Credentials>,
) -> Result<Response, ServiceError> {
    // With signup disabled the route plays dead rather than advertising
    // its existence.
    if !service.config().enable_signup {
        return Err(ServiceError::NotFound);
    }
    let origin = request_origin(&headers);
    let session = service
        .signup(&credentials.username, &credentials.password, origin.as_deref())
        .await?;
    session_response(service.config(), &session, StatusCode::CREATED)
}
