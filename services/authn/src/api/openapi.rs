use super::handlers::{accounts, admin, health, jwks, password, session};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated spec. Handlers sharing a path share a
/// `routes!` call.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(jwks::jwks))
        .routes(routes!(accounts::signup))
        .routes(routes!(session::login, session::logout))
        .routes(routes!(session::refresh))
        .routes(routes!(password::update))
        .routes(routes!(password::request_reset))
        .routes(routes!(admin::get_account, admin::archive))
        .routes(routes!(admin::lock))
        .routes(routes!(admin::unlock))
        .routes(routes!(admin::expire_password))
        .routes(routes!(admin::stats));

    let mut session_tag = Tag::new("session");
    session_tag.description = Some("Login, logout, and access-token refresh".to_string());

    let mut password_tag = Tag::new("password");
    password_tag.description = Some("Password change and reset".to_string());

    let mut admin_tag = Tag::new("admin");
    admin_tag.description = Some("Account administration, behind basic auth".to_string());

    router.get_openapi_mut().tags = Some(vec![session_tag, password_tag, admin_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    OpenApiBuilder::new().info(info).build()
}
