use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::JwtConfig;

/// Why a presented token was not accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
}

/// Claims carried by both token kinds. Access tokens have no `jti`.
///
/// Every business claim is optional on the way in so that a well-signed token
/// with a missing subject can be told apart from a forged one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_subject"
    )]
    pub sub: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Issued at (Unix timestamp), set when signing.
    #[serde(default)]
    pub iat: i64,
    /// Expiration time (Unix timestamp), set when signing.
    #[serde(default)]
    pub exp: i64,
}

impl TokenClaims {
    pub fn new(user_id: i64, email: &str) -> Self {
        Self {
            sub: Some(user_id),
            email: Some(email.to_string()),
            ..Default::default()
        }
    }

    pub fn with_jti(mut self, jti: impl Into<String>) -> Self {
        self.jti = Some(jti.into());
        self
    }
}

/// Accept `sub` as a JSON number or a numeric string; anything else reads as absent.
fn lenient_subject<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Sign `claims` with HS256, expiring `ttl_seconds` from now.
pub fn sign(claims: &TokenClaims, secret: &str, ttl_seconds: u64) -> Result<String, anyhow::Error> {
    sign_at(claims, secret, Utc::now(), ttl_seconds)
}

/// `issued_at + ttl_seconds`, or an error when that is not a representable instant.
pub fn expires_at(
    issued_at: DateTime<Utc>,
    ttl_seconds: u64,
) -> Result<DateTime<Utc>, anyhow::Error> {
    i64::try_from(ttl_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| issued_at.checked_add_signed(ttl))
        .ok_or_else(|| anyhow::anyhow!("Token TTL out of range: {}", ttl_seconds))
}

/// Sign `claims` as if issued at `issued_at`.
pub fn sign_at(
    claims: &TokenClaims,
    secret: &str,
    issued_at: DateTime<Utc>,
    ttl_seconds: u64,
) -> Result<String, anyhow::Error> {
    let mut claims = claims.clone();
    claims.iat = issued_at.timestamp();
    claims.exp = expires_at(issued_at, ttl_seconds)?.timestamp();

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| anyhow::anyhow!("Failed to encode token: {}", e))
}

/// Verify signature and expiry (no leeway) and return the claims.
pub fn verify(token: &str, secret: &str) -> Result<TokenClaims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;

    decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    })
}

/// Output of a login or refresh: both raw tokens plus what the session needs.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub jti: String,
    pub issued_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_expires_in: u64,
    pub refresh_expires_in: u64,
}

/// Issues and checks access/refresh tokens with separate secrets.
#[derive(Clone)]
pub struct JwtService {
    access_secret: String,
    refresh_secret: String,
    access_ttl_seconds: u64,
    refresh_ttl_seconds: u64,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        tracing::info!(
            access_ttl_seconds = config.access_ttl_seconds,
            refresh_ttl_seconds = config.refresh_ttl_seconds,
            "JWT service initialized with HS256 secrets"
        );

        Self {
            access_secret: config.access_secret.clone(),
            refresh_secret: config.refresh_secret.clone(),
            access_ttl_seconds: config.access_ttl_seconds,
            refresh_ttl_seconds: config.refresh_ttl_seconds,
        }
    }

    /// Sign a fresh access/refresh pair under a new UUID v4 `jti`.
    pub fn issue_pair(&self, user_id: i64, email: &str) -> Result<IssuedTokens, anyhow::Error> {
        let issued_at = Utc::now();
        let refresh_expires_at = expires_at(issued_at, self.refresh_ttl_seconds)?;
        let jti = Uuid::new_v4().to_string();

        let access_token = sign_at(
            &TokenClaims::new(user_id, email),
            &self.access_secret,
            issued_at,
            self.access_ttl_seconds,
        )?;
        let refresh_token = sign_at(
            &TokenClaims::new(user_id, email).with_jti(jti.clone()),
            &self.refresh_secret,
            issued_at,
            self.refresh_ttl_seconds,
        )?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            jti,
            issued_at,
            refresh_expires_at,
            access_expires_in: self.access_ttl_seconds,
            refresh_expires_in: self.refresh_ttl_seconds,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<TokenClaims, TokenError> {
        verify(token, &self.access_secret)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<TokenClaims, TokenError> {
        verify(token, &self.refresh_secret)
    }

    pub fn access_ttl_seconds(&self) -> u64 {
        self.access_ttl_seconds
    }

    pub fn refresh_ttl_seconds(&self) -> u64 {
        self.refresh_ttl_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_ttls(access_ttl_seconds: u64, refresh_ttl_seconds: u64) -> JwtService {
        JwtService::new(&JwtConfig {
            access_secret: "access-secret".to_string(),
            refresh_secret: "refresh-secret".to_string(),
            access_ttl_seconds,
            refresh_ttl_seconds,
        })
    }

    fn service() -> JwtService {
        service_with_ttls(900, 2_592_000)
    }

    #[test]
    fn pair_carries_subject_and_jti() {
        let jwt = service();
        let issued = jwt.issue_pair(42, "a@x.com").unwrap();

        let access = jwt.verify_access(&issued.access_token).unwrap();
        assert_eq!(access.sub, Some(42));
        assert_eq!(access.email.as_deref(), Some("a@x.com"));
        assert!(access.jti.is_none());
        assert_eq!(access.exp - access.iat, 900);

        let refresh = jwt.verify_refresh(&issued.refresh_token).unwrap();
        assert_eq!(refresh.sub, Some(42));
        assert_eq!(refresh.jti.as_deref(), Some(issued.jti.as_str()));
        assert_eq!(refresh.exp - refresh.iat, 2_592_000);
        assert_eq!(issued.refresh_expires_at.timestamp(), refresh.exp);
    }

    #[test]
    fn oversized_ttl_is_an_error_not_a_panic() {
        let claims = TokenClaims::new(1, "a@x.com");
        assert!(sign(&claims, "s", u64::MAX).is_err());
        assert!(sign(&claims, "s", i64::MAX as u64).is_err());
        assert!(sign(&claims, "s", 1u64 << 50).is_err());

        assert!(service_with_ttls(900, 1u64 << 50).issue_pair(1, "a@x.com").is_err());
        assert!(service_with_ttls(u64::MAX, 900).issue_pair(1, "a@x.com").is_err());
    }

    #[test]
    fn secrets_are_not_interchangeable() {
        let jwt = service();
        let issued = jwt.issue_pair(1, "a@x.com").unwrap();

        assert_eq!(
            jwt.verify_refresh(&issued.access_token).unwrap_err(),
            TokenError::Invalid
        );
        assert_eq!(
            jwt.verify_access(&issued.refresh_token).unwrap_err(),
            TokenError::Invalid
        );
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let token = sign_at(
            &TokenClaims::new(1, "a@x.com"),
            "s",
            Utc::now() - Duration::hours(2),
            60,
        )
        .unwrap();

        assert_eq!(verify(&token, "s").unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn expired_and_forged_is_invalid() {
        let token = sign_at(
            &TokenClaims::new(1, "a@x.com"),
            "other",
            Utc::now() - Duration::hours(2),
            60,
        )
        .unwrap();

        assert_eq!(verify(&token, "s").unwrap_err(), TokenError::Invalid);
    }

    #[test]
    fn tampered_payload_is_invalid() {
        let token = sign(&TokenClaims::new(1, "a@x.com"), "s", 60).unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[1] = parts[1].chars().rev().collect();

        assert_eq!(verify(&parts.join("."), "s").unwrap_err(), TokenError::Invalid);
        assert_eq!(verify("not-a-jwt", "s").unwrap_err(), TokenError::Invalid);
    }

    #[test]
    fn missing_subject_still_verifies() {
        let token = sign(&TokenClaims::default(), "s", 60).unwrap();
        let claims = verify(&token, "s").unwrap();
        assert!(claims.sub.is_none());
        assert!(claims.jti.is_none());
    }

    #[test]
    fn string_subject_is_accepted() {
        let now = Utc::now().timestamp();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({ "sub": "17", "jti": "j", "iat": now, "exp": now + 60 }),
            &EncodingKey::from_secret(b"s"),
        )
        .unwrap();

        assert_eq!(verify(&token, "s").unwrap().sub, Some(17));
    }
}
