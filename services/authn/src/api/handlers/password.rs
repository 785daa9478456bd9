//! Password change, reset request, and reset consumption.

use axum::{
    extract::{Extension, Form, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use utoipa::{IntoParams, ToSchema};

use super::{extract_session_token, request_origin, session_response};
use crate::error::ServiceError;
use crate::service::AccountService;
use crate::webhook::ResetWebhook;

#[derive(Debug, Deserialize, ToSchema)]
pub struct PasswordUpdate {
    /// New password. Always required.
    pub password: String,
    /// Current password, for session-authenticated changes.
    #[serde(default)]
    pub current_password: Option<String>,
    /// Signed reset token, for mailbox-proved changes.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ResetRequestArgs {
    pub username: String,
}

#[utoipa::path(
    post,
    path = "/password",
    request_body(content = PasswordUpdate, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Password changed; fresh session cookie set, access token in body"),
        (status = 401, description = "Session, current password, or reset token rejected"),
        (status = 403, description = "Request origin matches no configured application domain"),
        (status = 422, description = "Replacement password rejected"),
    ),
    tag = "password"
)]
pub async fn update(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Form(update): Form<PasswordUpdate>,
) -> Result<Response, ServiceError> {
    let origin = request_origin(&headers);

    // A reset token is proof of mailbox control and takes precedence over
    // any session cookie on the request.
    let session = if let Some(token) = update.token.as_deref() {
        service
            .consume_reset(token, &update.password, origin.as_deref())
            .await?
    } else {
        let cookie_name = service.config().session_cookie_name.clone();
        let refresh_token =
            extract_session_token(&headers, &cookie_name).ok_or(ServiceError::SessionInvalid)?;
        let account_id = service.authenticate(&refresh_token).await?;
        let current = update.current_password.as_deref().ok_or(ServiceError::Failed)?;
        service
            .change_password(account_id, current, &update.password, origin.as_deref())
            .await?
    };

    session_response(service.config(), &session, StatusCode::CREATED)
}

#[utoipa::path(
    get,
    path = "/password/reset",
    params(ResetRequestArgs),
    responses(
        (status = 200, description = "Reset requested; a token was sent to the webhook when the account exists"),
        (status = 502, description = "The reset webhook rejected the delivery"),
    ),
    tag = "password"
)]
pub async fn request_reset(
    Extension(service): Extension<Arc<AccountService>>,
    Extension(webhook): Extension<Arc<ResetWebhook>>,
    Query(args): Query<ResetRequestArgs>,
) -> Result<Response, ServiceError> {
    match service.request_reset(&args.username).await {
        Ok((account_id, token)) => {
            webhook.deliver(account_id, &token).await?;
        }
        // Unknown accounts get the same 200 as known ones so this endpoint
        // cannot be used to enumerate usernames.
        Err(ServiceError::NotFound) => {
            debug!(username = %args.username, "reset requested for unknown account");
        }
        Err(err) => return Err(err),
    }
    Ok(StatusCode::OK.into_response())
}
