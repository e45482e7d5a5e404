//! One-shot email tokens and SMS codes proving ownership of a contact address.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use redis::{aio::ConnectionManager, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::VerificationConfig;
use crate::services::credential_store::CredentialStore;
use crate::services::error::AuthError;
use crate::services::notification::{
    EmailMessage, NotificationQueue, OutboundMessage, SmsMessage,
};
use crate::services::redis::bounded;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailVerificationClaim {
    pub user_id: i64,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneVerificationClaim {
    pub user_id: i64,
    pub phone: String,
    pub code: String,
}

#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Store `token` for the claim's user, dropping the user's previous token.
    async fn store_email_token(
        &self,
        token: &str,
        claim: &EmailVerificationClaim,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error>;

    /// Remove and return the claim for `token`.
    async fn take_email_token(
        &self,
        token: &str,
    ) -> Result<Option<EmailVerificationClaim>, anyhow::Error>;

    /// Store a code for the claim's phone, dropping the user's previous pending code.
    async fn store_phone_code(
        &self,
        claim: &PhoneVerificationClaim,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error>;

    async fn pending_phone_code(
        &self,
        phone: &str,
    ) -> Result<Option<PhoneVerificationClaim>, anyhow::Error>;

    async fn clear_phone_code(&self, claim: &PhoneVerificationClaim) -> Result<(), anyhow::Error>;
}

fn email_token_key(token: &str) -> String {
    format!("auth:verify-email:token:{}", token)
}

fn email_user_key(user_id: i64) -> String {
    format!("auth:verify-email:user:{}", user_id)
}

fn phone_key(phone: &str) -> String {
    format!("auth:verify-phone:phone:{}", phone)
}

fn phone_user_key(user_id: i64) -> String {
    format!("auth:verify-phone:user:{}", user_id)
}

// KEYS: user index. ARGV: new primary key, payload, ttl, index value, primary key prefix.
// Whatever the index pointed at before is deleted first.
const REPLACE_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[1])
if previous then
  redis.call('DEL', ARGV[5] .. previous)
end
redis.call('SET', ARGV[1], ARGV[2], 'EX', ARGV[3])
redis.call('SET', KEYS[1], ARGV[4], 'EX', ARGV[3])
return 1
"#;

// KEYS: token key. ARGV: user index prefix, token.
const TAKE_EMAIL_SCRIPT: &str = r#"
local payload = redis.call('GET', KEYS[1])
if not payload then
  return false
end
redis.call('DEL', KEYS[1])
local claim = cjson.decode(payload)
local index = ARGV[1] .. tostring(claim.user_id)
if redis.call('GET', index) == ARGV[2] then
  redis.call('DEL', index)
end
return payload
"#;

pub struct RedisVerificationStore {
    manager: ConnectionManager,
    replace_script: Script,
    take_email_script: Script,
}

impl RedisVerificationStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            replace_script: Script::new(REPLACE_SCRIPT),
            take_email_script: Script::new(TAKE_EMAIL_SCRIPT),
        }
    }
}

#[async_trait]
impl VerificationStore for RedisVerificationStore {
    async fn store_email_token(
        &self,
        token: &str,
        claim: &EmailVerificationClaim,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(claim)?;

        bounded(
            self.replace_script
                .key(email_user_key(claim.user_id))
                .arg(email_token_key(token))
                .arg(payload)
                .arg(ttl_seconds.max(1))
                .arg(token)
                .arg("auth:verify-email:token:")
                .invoke_async::<_, i64>(&mut conn),
            "store email token",
        )
        .await?;
        Ok(())
    }

    async fn take_email_token(
        &self,
        token: &str,
    ) -> Result<Option<EmailVerificationClaim>, anyhow::Error> {
        let mut conn = self.manager.clone();

        let payload: Option<String> = bounded(
            self.take_email_script
                .key(email_token_key(token))
                .arg("auth:verify-email:user:")
                .arg(token)
                .invoke_async(&mut conn),
            "take email token",
        )
        .await?;

        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    async fn store_phone_code(
        &self,
        claim: &PhoneVerificationClaim,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(claim)?;

        bounded(
            self.replace_script
                .key(phone_user_key(claim.user_id))
                .arg(phone_key(&claim.phone))
                .arg(payload)
                .arg(ttl_seconds.max(1))
                .arg(&claim.phone)
                .arg("auth:verify-phone:phone:")
                .invoke_async::<_, i64>(&mut conn),
            "store phone code",
        )
        .await?;
        Ok(())
    }

    async fn pending_phone_code(
        &self,
        phone: &str,
    ) -> Result<Option<PhoneVerificationClaim>, anyhow::Error> {
        let mut conn = self.manager.clone();

        let payload: Option<String> = bounded(
            redis::cmd("GET").arg(phone_key(phone)).query_async(&mut conn),
            "GET phone code",
        )
        .await?;

        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    async fn clear_phone_code(&self, claim: &PhoneVerificationClaim) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();

        bounded(
            redis::pipe()
                .del(phone_key(&claim.phone))
                .ignore()
                .del(phone_user_key(claim.user_id))
                .ignore()
                .query_async::<_, ()>(&mut conn),
            "clear phone code",
        )
        .await?;
        Ok(())
    }
}

/// In-process verification store. Expiry is checked on read.
#[derive(Default)]
pub struct InMemoryVerificationStore {
    inner: Mutex<InMemoryVerifications>,
}

#[derive(Default)]
struct InMemoryVerifications {
    email_tokens: HashMap<String, (EmailVerificationClaim, DateTime<Utc>)>,
    email_by_user: HashMap<i64, String>,
    phone_codes: HashMap<String, (PhoneVerificationClaim, DateTime<Utc>)>,
    phone_by_user: HashMap<i64, String>,
}

impl InMemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryVerifications>, anyhow::Error> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Verification store mutex poisoned: {}", e))
    }

    /// Latest email token issued to a user, if still pending.
    pub fn email_token_for(&self, user_id: i64) -> Option<String> {
        self.lock().ok()?.email_by_user.get(&user_id).cloned()
    }
}

fn deadline(ttl_seconds: u64) -> DateTime<Utc> {
    i64::try_from(ttl_seconds.max(1))
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl VerificationStore for InMemoryVerificationStore {
    async fn store_email_token(
        &self,
        token: &str,
        claim: &EmailVerificationClaim,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut inner = self.lock()?;
        if let Some(previous) = inner.email_by_user.insert(claim.user_id, token.to_string()) {
            inner.email_tokens.remove(&previous);
        }
        inner
            .email_tokens
            .insert(token.to_string(), (claim.clone(), deadline(ttl_seconds)));
        Ok(())
    }

    async fn take_email_token(
        &self,
        token: &str,
    ) -> Result<Option<EmailVerificationClaim>, anyhow::Error> {
        let mut inner = self.lock()?;
        let Some((claim, expires_at)) = inner.email_tokens.remove(token) else {
            return Ok(None);
        };
        if inner.email_by_user.get(&claim.user_id).map(String::as_str) == Some(token) {
            inner.email_by_user.remove(&claim.user_id);
        }
        Ok((expires_at > Utc::now()).then_some(claim))
    }

    async fn store_phone_code(
        &self,
        claim: &PhoneVerificationClaim,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut inner = self.lock()?;
        if let Some(previous) = inner.phone_by_user.insert(claim.user_id, claim.phone.clone()) {
            inner.phone_codes.remove(&previous);
        }
        inner
            .phone_codes
            .insert(claim.phone.clone(), (claim.clone(), deadline(ttl_seconds)));
        Ok(())
    }

    async fn pending_phone_code(
        &self,
        phone: &str,
    ) -> Result<Option<PhoneVerificationClaim>, anyhow::Error> {
        let inner = self.lock()?;
        Ok(inner
            .phone_codes
            .get(phone)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(claim, _)| claim.clone()))
    }

    async fn clear_phone_code(&self, claim: &PhoneVerificationClaim) -> Result<(), anyhow::Error> {
        let mut inner = self.lock()?;
        inner.phone_codes.remove(&claim.phone);
        inner.phone_by_user.remove(&claim.user_id);
        Ok(())
    }
}

/// Result of issuing an email verification.
#[derive(Debug, Clone)]
pub struct IssuedEmailVerification {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and confirms verifications, marking the user's flags on success.
#[derive(Clone)]
pub struct VerificationService {
    store: Arc<dyn VerificationStore>,
    users: Arc<dyn CredentialStore>,
    queue: NotificationQueue,
    config: VerificationConfig,
    sms_from: Option<String>,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        users: Arc<dyn CredentialStore>,
        queue: NotificationQueue,
        config: VerificationConfig,
        sms_from: Option<String>,
    ) -> Self {
        Self {
            store,
            users,
            queue,
            config,
            sms_from,
        }
    }

    pub async fn issue_email(
        &self,
        user_id: i64,
        email: &str,
    ) -> Result<IssuedEmailVerification, AuthError> {
        let token = Uuid::new_v4().simple().to_string();
        let claim = EmailVerificationClaim {
            user_id,
            email: email.to_string(),
        };

        self.store
            .store_email_token(&token, &claim, self.config.email_ttl_seconds)
            .await
            .map_err(AuthError::store)?;

        let link = format!(
            "{}/auth/verify-email?token={}",
            self.config.public_base_url, token
        );
        self.send(OutboundMessage::Email(EmailMessage {
            to: email.to_string(),
            subject: "Verify your email address".to_string(),
            text: format!(
                "Confirm your email address by opening this link:\n\n{}\n\nIf you did not create an account, ignore this message.",
                link
            ),
            html: Some(format!(
                r#"<p>Confirm your email address:</p><p><a href="{0}">{0}</a></p><p>If you did not create an account, ignore this message.</p>"#,
                link
            )),
        }));

        tracing::info!(user_id, "Email verification issued");
        Ok(IssuedEmailVerification {
            token,
            expires_at: deadline(self.config.email_ttl_seconds),
        })
    }

    /// Consume an email token and mark the address verified. Returns the user id.
    pub async fn confirm_email(&self, token: &str) -> Result<i64, AuthError> {
        let claim = self
            .store
            .take_email_token(token)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidVerification)?;

        if !self
            .users
            .mark_email_verified(claim.user_id)
            .await
            .map_err(AuthError::store)?
        {
            return Err(AuthError::UserNotFound);
        }

        tracing::info!(user_id = claim.user_id, "Email verified");
        Ok(claim.user_id)
    }

    /// Send a fresh six-digit code. Returns when it stops being accepted.
    pub async fn issue_phone(
        &self,
        user_id: i64,
        phone: &str,
    ) -> Result<DateTime<Utc>, AuthError> {
        let code = rand::thread_rng().gen_range(100_000..=999_999).to_string();
        let claim = PhoneVerificationClaim {
            user_id,
            phone: phone.to_string(),
            code: code.clone(),
        };

        self.store
            .store_phone_code(&claim, self.config.phone_ttl_seconds)
            .await
            .map_err(AuthError::store)?;

        self.send(OutboundMessage::Sms(SmsMessage {
            to: phone.to_string(),
            text: format!("Your verification code is {}", code),
            from: self.sms_from.clone(),
        }));

        tracing::info!(user_id, "Phone verification issued");
        Ok(deadline(self.config.phone_ttl_seconds))
    }

    /// Check a code for `phone` and mark the phone verified. Returns the user id.
    pub async fn confirm_phone(&self, phone: &str, code: &str) -> Result<i64, AuthError> {
        let claim = self
            .store
            .pending_phone_code(phone)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidVerification)?;

        if !bool::from(claim.code.as_bytes().ct_eq(code.trim().as_bytes())) {
            return Err(AuthError::InvalidVerification);
        }

        self.store
            .clear_phone_code(&claim)
            .await
            .map_err(AuthError::store)?;

        if !self
            .users
            .mark_phone_verified(claim.user_id)
            .await
            .map_err(AuthError::store)?
        {
            return Err(AuthError::UserNotFound);
        }

        tracing::info!(user_id = claim.user_id, "Phone verified");
        Ok(claim.user_id)
    }

    fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.queue.enqueue(message) {
            tracing::error!(error = %e, "Failed to queue verification message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewUser;
    use crate::services::credential_store::InMemoryCredentialStore;
    use crate::services::notification::{notification_channel, MockMailer, MockSmsSender};

    struct Fixture {
        service: VerificationService,
        store: Arc<InMemoryVerificationStore>,
        users: Arc<InMemoryCredentialStore>,
        mailer: Arc<MockMailer>,
        sms: Arc<MockSmsSender>,
        user_id: i64,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryVerificationStore::new());
        let users = Arc::new(InMemoryCredentialStore::new());
        let mailer = Arc::new(MockMailer::new());
        let sms = Arc::new(MockSmsSender::new());
        let (queue, dispatcher) = notification_channel(16, mailer.clone(), sms.clone());
        dispatcher.spawn();

        let user = users
            .create(NewUser {
                email: "a@x.com".to_string(),
                password_hash: "hash".to_string(),
                phone: Some("+15550001".to_string()),
            })
            .await
            .unwrap();

        let service = VerificationService::new(
            store.clone(),
            users.clone(),
            queue,
            VerificationConfig {
                email_ttl_seconds: 86_400,
                phone_ttl_seconds: 600,
                public_base_url: "http://localhost:8080".to_string(),
            },
            Some("TaskAuth".to_string()),
        );

        Fixture {
            service,
            store,
            users,
            mailer,
            sms,
            user_id: user.id,
        }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn email_token_is_single_use() {
        let f = fixture().await;
        let issued = f.service.issue_email(f.user_id, "a@x.com").await.unwrap();

        assert_eq!(f.service.confirm_email(&issued.token).await.unwrap(), f.user_id);
        assert!(matches!(
            f.service.confirm_email(&issued.token).await,
            Err(AuthError::InvalidVerification)
        ));

        let user = f.users.find_by_id(f.user_id).await.unwrap().unwrap();
        assert!(user.email_verified);

        settle().await;
        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .text
            .contains(&format!("/auth/verify-email?token={}", issued.token)));
    }

    #[tokio::test]
    async fn reissuing_email_invalidates_previous_token() {
        let f = fixture().await;
        let first = f.service.issue_email(f.user_id, "a@x.com").await.unwrap();
        let second = f.service.issue_email(f.user_id, "a@x.com").await.unwrap();

        assert_eq!(f.store.email_token_for(f.user_id), Some(second.token.clone()));
        assert!(matches!(
            f.service.confirm_email(&first.token).await,
            Err(AuthError::InvalidVerification)
        ));
        assert!(f.service.confirm_email(&second.token).await.is_ok());
    }

    #[tokio::test]
    async fn phone_code_must_match() {
        let f = fixture().await;
        f.service.issue_phone(f.user_id, "+15550001").await.unwrap();
        settle().await;

        let sent = f.sms.sent();
        assert_eq!(sent.len(), 1);
        let code: String = sent[0].text.chars().filter(char::is_ascii_digit).collect();
        assert_eq!(code.len(), 6);

        assert!(matches!(
            f.service.confirm_phone("+15550001", "000000x").await,
            Err(AuthError::InvalidVerification)
        ));
        assert_eq!(
            f.service.confirm_phone("+15550001", &code).await.unwrap(),
            f.user_id
        );
        assert!(matches!(
            f.service.confirm_phone("+15550001", &code).await,
            Err(AuthError::InvalidVerification)
        ));

        let user = f.users.find_by_id(f.user_id).await.unwrap().unwrap();
        assert!(user.phone_verified);
    }

    #[tokio::test]
    async fn expired_email_token_is_rejected() {
        let store = InMemoryVerificationStore::new();
        let claim = EmailVerificationClaim {
            user_id: 1,
            email: "a@x.com".to_string(),
        };
        store.store_email_token("t", &claim, 1).await.unwrap();
        store.lock().unwrap().email_tokens.get_mut("t").unwrap().1 =
            Utc::now() - Duration::seconds(1);

        assert!(store.take_email_token("t").await.unwrap().is_none());
    }
}
