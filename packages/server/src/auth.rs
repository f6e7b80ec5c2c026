//! Bearer token authorization.

use actix_web::HttpRequest;
use actix_web::http::header::AUTHORIZATION;
use riksdata_database::store::AccessDirectory as _;
use riksdata_database_models::{Principal, Role};

use crate::{ApiError, AppState};

/// Extracts the raw token from an `Authorization: Bearer <token>` header.
fn bearer_token(req: &HttpRequest) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Resolves the caller and requires the admin role. Runs before any body
/// parsing or remote fetch.
///
/// # Errors
///
/// * [`ApiError::Unauthorized`] if the header is missing, malformed, or
///   names an unknown token.
/// * [`ApiError::Forbidden`] if the caller is not an admin.
/// * [`ApiError::Internal`] if the token directory cannot be read.
pub async fn require_admin(state: &AppState, req: &HttpRequest) -> Result<Principal, ApiError> {
    let Some(token) = bearer_token(req) else {
        return Err(ApiError::Unauthorized);
    };

    let principal = state
        .store
        .principal_for_token(token)
        .await
        .map_err(|e| ApiError::Internal(format!("Token lookup failed: {e}")))?
        .ok_or(ApiError::Unauthorized)?;

    if !principal.has_role(Role::Admin) {
        log::warn!("User {} is not an admin", principal.user_id);
        return Err(ApiError::Forbidden);
    }

    Ok(principal)
}
