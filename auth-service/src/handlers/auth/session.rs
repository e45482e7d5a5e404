use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;

use super::{refresh_cookie, with_session_cookies, without_session_cookies};
use crate::{
    dtos::auth::{
        LoginRequest, LoginResponse, LogsQuery, LogsResponse, RefreshRequest, SuccessResponse,
    },
    middleware::{AuthUser, DeviceFingerprint},
    models::UserResponse,
    services::{AuthSession, ClientMeta},
    utils::{Password, ValidatedJson},
    AppState,
};

fn session_response(session: &AuthSession) -> LoginResponse {
    LoginResponse {
        user: session.user.sanitized(),
        access_expires_in: session.access_expires_in,
        refresh_expires_in: session.refresh_expires_in,
    }
}

/// Login with email and password
///
/// Tokens are set as `accessToken` / `refreshToken` HTTP-only cookies bound
/// to the calling device.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 400, description = "Device could not be identified", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    device: DeviceFingerprint,
    client: ClientMeta,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .auth
        .login(&req.email, &Password::new(req.password), device.as_deref(), client)
        .await?;

    let jar = with_session_cookies(jar, &session, state.config.security.cookie_secure);
    Ok((StatusCode::OK, jar, Json(session_response(&session))))
}

/// Rotate the refresh token
///
/// The token is read from the body when present, otherwise from the
/// `refreshToken` cookie.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body(content = RefreshRequest, description = "Optional when the refresh cookie is set"),
    responses(
        (status = 200, description = "Tokens rotated", body = LoginResponse),
        (status = 400, description = "No refresh token or device", body = ErrorResponse),
        (status = 401, description = "Token or session rejected", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    device: DeviceFingerprint,
    client: ClientMeta,
    jar: CookieJar,
    body: Option<Json<RefreshRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let from_body = body
        .and_then(|Json(req)| req.refresh_token)
        .filter(|t| !t.is_empty());
    let token = match from_body {
        Some(token) => token,
        None => refresh_cookie(&jar)?,
    };

    let session = state
        .auth
        .refresh(&token, device.as_deref(), client)
        .await?;

    let jar = with_session_cookies(jar, &session, state.config.security.cookie_secure);
    Ok((StatusCode::OK, jar, Json(session_response(&session))))
}

/// Log out the calling device
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = SuccessResponse),
        (status = 400, description = "No refresh cookie", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<AppState>,
    device: DeviceFingerprint,
    client: ClientMeta,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    let token = refresh_cookie(&jar)?;

    state
        .auth
        .logout(&token, device.as_deref(), client)
        .await?;

    Ok((without_session_cookies(jar), Json(SuccessResponse::ok())))
}

/// Log out every device of the token's user
#[utoipa::path(
    post,
    path = "/auth/logout-all",
    responses(
        (status = 200, description = "All sessions revoked", body = SuccessResponse),
        (status = 400, description = "No refresh cookie", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn logout_all(
    State(state): State<AppState>,
    client: ClientMeta,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    let token = refresh_cookie(&jar)?;

    state.auth.logout_all(&token, client).await?;

    Ok((without_session_cookies(jar), Json(SuccessResponse::ok())))
}

/// Current user
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Authenticated user", body = UserResponse),
        (status = 401, description = "Missing, expired or invalid access token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(
        ("bearer_auth" = []),
        ("cookie_auth" = [])
    )
)]
pub async fn me(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = state.auth.current_user(user.user_id).await?;
    Ok(Json(user.sanitized()))
}

/// Newest authentication events of the calling user
#[utoipa::path(
    get,
    path = "/auth/logs",
    params(LogsQuery),
    responses(
        (status = 200, description = "Events, newest first", body = LogsResponse),
        (status = 401, description = "Missing, expired or invalid access token", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(
        ("bearer_auth" = []),
        ("cookie_auth" = [])
    )
)]
pub async fn logs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, AppError> {
    let events = state
        .auth
        .events()
        .recent_for_user(user.user_id, query.effective_limit())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to read auth events");
            AppError::ServiceUnavailable
        })?;

    Ok(Json(LogsResponse { events }))
}
