//! Services layer for auth-service.
//!
//! The session manager plus the stores and delivery channels it is wired to.

pub mod auth;
pub mod auth_log;
pub mod credential_store;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod notification;
pub mod redis;
pub mod session_store;
pub mod verification;

pub use auth::{AuthService, AuthSession, ClientMeta};
pub use auth_log::{AuthEventLog, InMemoryAuthEventLog, RedisAuthEventLog};
pub use credential_store::{
    CredentialError, CredentialStore, InMemoryCredentialStore, PgCredentialStore,
};
pub use error::AuthError;
pub use jwt::{IssuedTokens, JwtService, TokenClaims, TokenError};
pub use notification::{
    notification_channel, Mailer, NotificationDispatcher, NotificationQueue, OutboundMessage,
    SmsSender,
};
pub use redis::RedisService;
pub use session_store::{DeviceSessionStore, InMemorySessionStore, RedisSessionStore};
pub use verification::{
    InMemoryVerificationStore, RedisVerificationStore, VerificationService, VerificationStore,
};
