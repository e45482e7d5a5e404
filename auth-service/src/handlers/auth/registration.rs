use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::{
    dtos::auth::{
        RegisterRequest, RegisterResponse, VerificationMethod, VerifyEmailQuery,
        VerifyPhoneRequest, VerifyResponse,
    },
    utils::{Password, ValidatedJson},
    AppState,
};

/// Register a new user
///
/// Sends an email link or an SMS code, depending on `verification_method`.
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = RegisterResponse),
        (status = 409, description = "Email or phone already in use", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let method = req.verification_method.unwrap_or_default();
    if method == VerificationMethod::Sms && req.phone.is_none() {
        return Err(AppError::domain(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            "Phone is required for SMS verification",
        ));
    }

    let user = state
        .auth
        .register(&req.email, &Password::new(req.password), req.phone.as_deref())
        .await?;

    // The account exists at this point; a failed send only costs the user a resend.
    let issued = match (method, user.phone.as_deref()) {
        (VerificationMethod::Sms, Some(phone)) => state
            .verification
            .issue_phone(user.id, phone)
            .await
            .map(|_| ()),
        _ => state
            .verification
            .issue_email(user.id, &user.email)
            .await
            .map(|_| ()),
    };
    if let Err(e) = issued {
        tracing::error!(error = %e, user_id = user.id, "Failed to issue verification");
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id,
            email: user.email,
        }),
    ))
}

/// Confirm an email address
#[utoipa::path(
    get,
    path = "/auth/verify-email",
    params(VerifyEmailQuery),
    responses(
        (status = 200, description = "Email verified", body = VerifyResponse),
        (status = 400, description = "Unknown or expired token", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Verification"
)]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<Json<VerifyResponse>, AppError> {
    query.validate()?;

    let user_id = state.verification.confirm_email(&query.token).await?;
    Ok(Json(VerifyResponse {
        verified: true,
        user_id,
    }))
}

/// Confirm a phone number with the SMS code
#[utoipa::path(
    post,
    path = "/auth/verify-phone",
    request_body = VerifyPhoneRequest,
    responses(
        (status = 200, description = "Phone verified", body = VerifyResponse),
        (status = 400, description = "Wrong or expired code", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "Verification"
)]
pub async fn verify_phone(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<VerifyPhoneRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    let user_id = state
        .verification
        .confirm_phone(&req.phone, &req.code)
        .await?;

    Ok(Json(VerifyResponse {
        verified: true,
        user_id,
    }))
}
