//! Session authentication for HTTP routes.
//!
//! Sessions are issued elsewhere; this module only turns a presented token
//! into a user id. The token comes from `Authorization: Bearer <token>` or
//! the `session_token` cookie, in that order.

use axum::extract::FromRef;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::error;
use uuid::Uuid;

use crate::state::AppState;

const COOKIE_NAME: &str = "session_token";

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the request.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub user_id: Uuid,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or(StatusCode::UNAUTHORIZED)?;
        let app_state = AppState::from_ref(state);
        let user_id = resolve_token(&app_state, &token).await?;
        Ok(Self { user_id })
    }
}

fn token_from_parts(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_owned());
    }

    let jar = CookieJar::from_headers(&parts.headers);
    jar.get(COOKIE_NAME)
        .map(Cookie::value)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

/// Resolve a session token to a user id.
///
/// # Errors
///
/// `401` for an unknown token, `500` if the store is unreachable.
pub(crate) async fn resolve_token(state: &AppState, token: &str) -> Result<Uuid, StatusCode> {
    state
        .store
        .user_for_session(token)
        .await
        .map_err(|e| {
            error!(error = %e, "session lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)
}
