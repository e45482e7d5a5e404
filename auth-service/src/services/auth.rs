//! Session manager: login, refresh rotation, logout and registration.

use chrono::Utc;
use std::sync::Arc;

use crate::models::{
    hash_token, AuthEvent, AuthEventKind, DeviceSession, NewUser, SessionRotation, User,
};
use crate::services::auth_log::AuthEventLog;
use crate::services::credential_store::{CredentialError, CredentialStore};
use crate::services::error::AuthError;
use crate::services::jwt::{IssuedTokens, JwtService, TokenError};
use crate::services::metrics::record_auth_event;
use crate::services::session_store::DeviceSessionStore;
use crate::utils::{hash_password, Password};

/// Request metadata kept on the session and in the event log.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Result of a successful login or refresh.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_in: u64,
    pub refresh_expires_in: u64,
}

impl AuthSession {
    fn new(user: User, tokens: IssuedTokens) -> Self {
        Self {
            user,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_expires_in: tokens.access_expires_in,
            refresh_expires_in: tokens.refresh_expires_in,
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn CredentialStore>,
    sessions: Arc<dyn DeviceSessionStore>,
    jwt: JwtService,
    events: Arc<dyn AuthEventLog>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn CredentialStore>,
        sessions: Arc<dyn DeviceSessionStore>,
        jwt: JwtService,
        events: Arc<dyn AuthEventLog>,
    ) -> Self {
        Self {
            users,
            sessions,
            jwt,
            events,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub fn users(&self) -> &Arc<dyn CredentialStore> {
        &self.users
    }

    pub fn events(&self) -> &Arc<dyn AuthEventLog> {
        &self.events
    }

    /// Authenticate and bind a fresh refresh token to `device_id`,
    /// replacing whatever session that device had before.
    pub async fn login(
        &self,
        email: &str,
        password: &Password,
        device_id: Option<&str>,
        client: ClientMeta,
    ) -> Result<AuthSession, AuthError> {
        let email = normalize_email(email);
        let result = self.try_login(&email, password, device_id, &client).await;

        let event = AuthEvent::new(AuthEventKind::LoginSuccess)
            .email(email.as_str())
            .device(device_id)
            .client(client.ip, client.user_agent);
        match &result {
            Ok(session) => self.record(event.user(session.user.id)).await,
            Err(e) => {
                let mut event = event.reason(e.code());
                event.kind = AuthEventKind::LoginFail;
                self.record(event).await;
            }
        }

        result
    }

    async fn try_login(
        &self,
        email: &str,
        password: &Password,
        device_id: Option<&str>,
        client: &ClientMeta,
    ) -> Result<AuthSession, AuthError> {
        let device_id = device_id.ok_or(AuthError::MissingDevice)?;

        let user = self
            .users
            .find_by_email(email)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidCredentials)?;

        let valid = self
            .users
            .verify_password(password, &user.password_hash)
            .map_err(AuthError::Internal)?;
        if !valid {
            return Err(AuthError::InvalidCredentials);
        }

        let tokens = self
            .jwt
            .issue_pair(user.id, &user.email)
            .map_err(AuthError::Internal)?;

        let session = DeviceSession {
            user_id: user.id,
            device_id: device_id.to_string(),
            jti: tokens.jti.clone(),
            refresh_token_hash: hash_token(&tokens.refresh_token),
            is_revoked: false,
            last_used_at: tokens.issued_at,
            expire_at: tokens.refresh_expires_at,
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        };
        self.sessions
            .save(&session)
            .await
            .map_err(AuthError::store)?;

        tracing::info!(user_id = user.id, "User logged in");
        Ok(AuthSession::new(user, tokens))
    }

    /// Trade a refresh token for a new pair, rotating the device's session.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
        client: ClientMeta,
    ) -> Result<AuthSession, AuthError> {
        let result = self.try_refresh(refresh_token, device_id, &client).await;

        let event = AuthEvent::new(AuthEventKind::RefreshSuccess)
            .device(device_id)
            .client(client.ip, client.user_agent);
        match &result {
            Ok(session) => {
                self.record(event.user(session.user.id).email(session.user.email.as_str()))
                    .await
            }
            Err(e) => {
                let mut event = event.reason(e.code());
                event.kind = AuthEventKind::RefreshFail;
                self.record(event).await;
            }
        }

        result
    }

    async fn try_refresh(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
        client: &ClientMeta,
    ) -> Result<AuthSession, AuthError> {
        let device_id = device_id.ok_or(AuthError::MissingDevice)?;

        let claims = self.jwt.verify_refresh(refresh_token).map_err(|e| match e {
            TokenError::Expired => AuthError::TokenExpired,
            TokenError::Invalid => AuthError::InvalidToken,
        })?;
        let (Some(user_id), Some(jti)) = (claims.sub, claims.jti) else {
            return Err(AuthError::MalformedPayload);
        };

        let session = self
            .sessions
            .get(user_id, device_id)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::SessionRevoked)?;

        if session.is_revoked {
            return Err(AuthError::SessionRevoked);
        }
        if session.is_expired_at(Utc::now()) {
            return Err(AuthError::SessionExpired);
        }
        if session.jti != jti {
            tracing::warn!(user_id, "Refresh token replayed after rotation");
            return Err(AuthError::JtiMismatch);
        }
        if !session.matches_token(refresh_token) {
            return Err(AuthError::HashMismatch);
        }

        let user = self
            .users
            .find_by_id(user_id)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::UserNotFound)?;

        let tokens = self
            .jwt
            .issue_pair(user.id, &user.email)
            .map_err(AuthError::Internal)?;

        let rotation = SessionRotation {
            jti: tokens.jti.clone(),
            refresh_token_hash: hash_token(&tokens.refresh_token),
            last_used_at: tokens.issued_at,
            expire_at: tokens.refresh_expires_at,
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        };
        let rotated = self
            .sessions
            .rotate(user_id, device_id, &jti, &rotation)
            .await
            .map_err(AuthError::store)?;
        if !rotated {
            return Err(self.lost_rotation(user_id, device_id).await);
        }

        tracing::debug!(user_id, "Refresh token rotated");
        Ok(AuthSession::new(user, tokens))
    }

    /// Revoke the device's session. Tokens that do not verify are ignored.
    pub async fn logout(
        &self,
        refresh_token: &str,
        device_id: Option<&str>,
        client: ClientMeta,
    ) -> Result<(), AuthError> {
        let Some(user_id) = self.token_subject(refresh_token) else {
            return Ok(());
        };
        let Some(device_id) = device_id else {
            return Ok(());
        };

        self.sessions
            .revoke(user_id, device_id)
            .await
            .map_err(AuthError::store)?;

        tracing::info!(user_id, "Device logged out");
        self.record(
            AuthEvent::new(AuthEventKind::Logout)
                .user(user_id)
                .device(Some(device_id))
                .client(client.ip, client.user_agent),
        )
        .await;
        Ok(())
    }

    /// Revoke every session of the token's user. Tokens that do not verify are ignored.
    pub async fn logout_all(
        &self,
        refresh_token: &str,
        client: ClientMeta,
    ) -> Result<(), AuthError> {
        let Some(user_id) = self.token_subject(refresh_token) else {
            return Ok(());
        };

        let removed = self
            .sessions
            .revoke_all(user_id)
            .await
            .map_err(AuthError::store)?;

        tracing::info!(user_id, sessions = removed, "All devices logged out");
        self.record(
            AuthEvent::new(AuthEventKind::LogoutAll)
                .user(user_id)
                .client(client.ip, client.user_agent),
        )
        .await;
        Ok(())
    }

    pub async fn register(
        &self,
        email: &str,
        password: &Password,
        phone: Option<&str>,
    ) -> Result<User, AuthError> {
        let email = normalize_email(email);
        let phone = phone.map(str::trim).filter(|p| !p.is_empty());

        if self
            .users
            .find_by_email(&email)
            .await
            .map_err(AuthError::store)?
            .is_some()
        {
            return Err(AuthError::EmailInUse);
        }
        if let Some(phone) = phone {
            if self
                .users
                .find_by_phone(phone)
                .await
                .map_err(AuthError::store)?
                .is_some()
            {
                return Err(AuthError::PhoneInUse);
            }
        }

        let password_hash = hash_password(password).map_err(AuthError::Internal)?;

        // The unique constraints catch a concurrent registration that slipped past the lookups.
        let user = self
            .users
            .create(NewUser {
                email,
                password_hash: password_hash.into_string(),
                phone: phone.map(str::to_string),
            })
            .await
            .map_err(|e| match e {
                CredentialError::DuplicateEmail => AuthError::EmailInUse,
                CredentialError::DuplicatePhone => AuthError::PhoneInUse,
                CredentialError::Store(e) => AuthError::store(e),
            })?;

        tracing::info!(user_id = user.id, "User registered");
        Ok(user)
    }

    /// Resolve the user behind a valid access token.
    pub async fn current_user(&self, user_id: i64) -> Result<User, AuthError> {
        self.users
            .find_by_id(user_id)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::UserNotFound)
    }

    /// Classify a rotation that found the session no longer holding our jti.
    async fn lost_rotation(&self, user_id: i64, device_id: &str) -> AuthError {
        match self.sessions.get(user_id, device_id).await {
            Ok(Some(session)) if !session.is_revoked => {
                tracing::warn!(user_id, "Refresh lost a rotation race");
                AuthError::JtiMismatch
            }
            Ok(_) => AuthError::SessionRevoked,
            Err(e) => AuthError::store(e),
        }
    }

    fn token_subject(&self, refresh_token: &str) -> Option<i64> {
        self.jwt.verify_refresh(refresh_token).ok()?.sub
    }

    async fn record(&self, event: AuthEvent) {
        record_auth_event(event.kind);
        if let Err(e) = self.events.log(&event).await {
            tracing::warn!(error = %e, event = event.kind.as_str(), "Failed to write auth event");
        }
    }
}
