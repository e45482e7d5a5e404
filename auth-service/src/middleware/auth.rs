use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use crate::{
    handlers::auth::ACCESS_COOKIE,
    services::{TokenClaims, TokenError},
    AppState,
};

/// Access token from the `accessToken` cookie, else from `Authorization: Bearer`.
fn access_token(headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = CookieJar::from_headers(headers).get(ACCESS_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Middleware to require a valid access token.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = access_token(req.headers()).ok_or_else(|| {
        AppError::domain(
            StatusCode::UNAUTHORIZED,
            "MISSING_ACCESS_TOKEN",
            "Access token missing",
        )
    })?;

    let claims = state.auth.jwt().verify_access(&token).map_err(|e| match e {
        TokenError::Expired => {
            AppError::domain(StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED", "Access token expired")
        }
        TokenError::Invalid => {
            AppError::domain(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Invalid access token")
        }
    })?;

    if claims.sub.is_none() {
        return Err(AppError::domain(
            StatusCode::UNAUTHORIZED,
            "INVALID_TOKEN",
            "Invalid access token",
        ));
    }

    // Store claims in request extensions so handlers can access them
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Claims of the caller's access token. Only usable behind `auth_middleware`.
pub struct AuthUser {
    pub user_id: i64,
    pub claims: TokenClaims,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts
            .extensions
            .get::<TokenClaims>()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Auth claims missing from request extensions"))?;
        let user_id = claims.sub.ok_or_else(|| {
            AppError::domain(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "Invalid access token")
        })?;

        Ok(AuthUser { user_id, claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_wins_over_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("accessToken=from-cookie"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(access_token(&headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn bearer_header_is_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(access_token(&headers).as_deref(), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(access_token(&headers), None);
    }
}
