pub mod registration;
pub mod session;

pub use registration::*;
pub use session::*;

use axum::http::StatusCode;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::error::AppError;

use crate::services::AuthSession;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";
/// Left behind by older clients; only ever cleared.
pub const LEGACY_DEVICE_COOKIE: &str = "deviceId";

fn token_cookie(
    name: &'static str,
    value: String,
    max_age_seconds: u64,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::seconds(
            i64::try_from(max_age_seconds).unwrap_or(i64::MAX),
        ))
        .build()
}

/// Put both tokens of a fresh session into the jar.
pub fn with_session_cookies(jar: CookieJar, session: &AuthSession, secure: bool) -> CookieJar {
    jar.add(token_cookie(
        ACCESS_COOKIE,
        session.access_token.clone(),
        session.access_expires_in,
        secure,
    ))
    .add(token_cookie(
        REFRESH_COOKIE,
        session.refresh_token.clone(),
        session.refresh_expires_in,
        secure,
    ))
}

pub fn without_session_cookies(jar: CookieJar) -> CookieJar {
    [ACCESS_COOKIE, REFRESH_COOKIE, LEGACY_DEVICE_COOKIE]
        .into_iter()
        .fold(jar, |jar, name| {
            jar.remove(Cookie::build(name).path("/").build())
        })
}

/// Refresh token from the jar, or a 400 when the client sent none.
pub fn refresh_cookie(jar: &CookieJar) -> Result<String, AppError> {
    jar.get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(missing_refresh_token)
}

pub fn missing_refresh_token() -> AppError {
    AppError::domain(
        StatusCode::BAD_REQUEST,
        "MISSING_REFRESH_TOKEN",
        "Refresh token missing",
    )
}
