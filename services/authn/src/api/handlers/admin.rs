//! Administrative endpoints, behind HTTP basic auth.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use utoipa::ToSchema;

use super::require_admin;
use crate::service::AccountService;

#[derive(Debug, Serialize, ToSchema)]
pub struct AccountResponse {
    pub id: i64,
    pub username: String,
    pub locked: bool,
    pub deleted: bool,
}

#[utoipa::path(
    get,
    path = "/accounts/{id}",
    params(("id" = i64, Path, description = "Account id")),
    responses(
        (status = 200, description = "Account state", body = AccountResponse),
        (status = 401, description = "Missing or bad admin credentials"),
        (status = 404, description = "Unknown account"),
    ),
    tag = "admin"
)]
pub async fn get_account(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(response) = require_admin(&headers, service.config()) {
        return response;
    }
    match service.account(id).await {
        Ok(account) => {
            // The password hash never crosses this boundary.
            let body = AccountResponse {
                id: account.id,
                username: account.username,
                locked: account.locked,
                deleted: account.deleted,
            };
            (StatusCode::OK, Json(json!({ "result": body }))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    patch,
    path = "/accounts/{id}/lock",
    params(("id" = i64, Path, description = "Account id")),
    responses(
        (status = 200, description = "Account locked and its sessions revoked"),
        (status = 401, description = "Missing or bad admin credentials"),
        (status = 404, description = "Unknown account"),
    ),
    tag = "admin"
)]
pub async fn lock(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(response) = require_admin(&headers, service.config()) {
        return response;
    }
    match service.lock(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    patch,
    path = "/accounts/{id}/unlock",
    params(("id" = i64, Path, description = "Account id")),
    responses(
        (status = 200, description = "Account unlocked"),
        (status = 401, description = "Missing or bad admin credentials"),
        (status = 404, description = "Unknown account"),
    ),
    tag = "admin"
)]
pub async fn unlock(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(response) = require_admin(&headers, service.config()) {
        return response;
    }
    match service.unlock(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    patch,
    path = "/accounts/{id}/expire_password",
    params(("id" = i64, Path, description = "Account id")),
    responses(
        (status = 200, description = "Password change required on next login"),
        (status = 401, description = "Missing or bad admin credentials"),
        (status = 404, description = "Unknown account"),
    ),
    tag = "admin"
)]
pub async fn expire_password(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(response) = require_admin(&headers, service.config()) {
        return response;
    }
    match service.require_new_password(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    delete,
    path = "/accounts/{id}",
    params(("id" = i64, Path, description = "Account id")),
    responses(
        (status = 200, description = "Account archived: sessions revoked, credentials zeroed"),
        (status = 401, description = "Missing or bad admin credentials"),
        (status = 404, description = "Unknown account"),
    ),
    tag = "admin"
)]
pub async fn archive(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if let Err(response) = require_admin(&headers, service.config()) {
        return response;
    }
    match service.archive(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "Daily and weekly active-account counts"),
        (status = 401, description = "Missing or bad admin credentials"),
    ),
    tag = "admin"
)]
pub async fn stats(
    Extension(service): Extension<Arc<AccountService>>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&headers, service.config()) {
        return response;
    }
    let daily = match service.daily_actives().await {
        Ok(daily) => daily,
        Err(err) => return err.into_response(),
    };
    let weekly = match service.weekly_actives().await {
        Ok(weekly) => weekly,
        Err(err) => return err.into_response(),
    };
    (
        StatusCode::OK,
        Json(json!({ "result": { "daily": daily, "weekly": weekly } })),
    )
        .into_response()
}
