//! User identities and password hashes.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{NewUser, User};
use crate::utils::{verify_password, Password, PasswordHashString};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error("phone already registered")]
    DuplicatePhone,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, anyhow::Error>;
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, anyhow::Error>;
    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, anyhow::Error>;

    /// Insert a user. Unique-key races surface as `DuplicateEmail` / `DuplicatePhone`.
    async fn create(&self, user: NewUser) -> Result<User, CredentialError>;

    /// Returns `false` when no such user exists.
    async fn mark_email_verified(&self, id: i64) -> Result<bool, anyhow::Error>;
    async fn mark_phone_verified(&self, id: i64) -> Result<bool, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;

    /// Opaque password check against a stored hash.
    fn verify_password(&self, plain: &Password, hash: &str) -> Result<bool, anyhow::Error> {
        verify_password(plain, &PasswordHashString::new(hash.to_string()))
    }
}

/// PostgreSQL-backed credential store.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const USER_COLUMNS: &str =
    "id, email, password_hash, phone, email_verified, phone_verified, created_at, updated_at";

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, anyhow::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to find user by email: {}", e))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, anyhow::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to find user by id: {}", e))
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, anyhow::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE phone = $1"))
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to find user by phone: {}", e))
    }

    async fn create(&self, user: NewUser) -> Result<User, CredentialError> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, phone)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.phone)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint() == Some("users_email_key") => {
                CredentialError::DuplicateEmail
            }
            sqlx::Error::Database(db) if db.constraint() == Some("users_phone_key") => {
                CredentialError::DuplicatePhone
            }
            _ => CredentialError::Store(anyhow::anyhow!("Failed to insert user: {}", e)),
        })
    }

    async fn mark_email_verified(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result =
            sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to mark email verified: {}", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_phone_verified(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result =
            sqlx::query("UPDATE users SET phone_verified = TRUE, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to mark phone verified: {}", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        crate::db::health_check(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Database health check failed: {}", e))
    }
}

/// In-process credential store for tests and local runs.
pub struct InMemoryCredentialStore {
    users: Mutex<BTreeMap<i64, User>>,
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(BTreeMap::new()),
        }
    }

    fn find(&self, pred: impl Fn(&User) -> bool) -> Result<Option<User>, anyhow::Error> {
        let users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("Credential store mutex poisoned: {}", e))?;
        Ok(users.values().find(|u| pred(u)).cloned())
    }

    fn update(&self, id: i64, apply: impl FnOnce(&mut User)) -> Result<bool, anyhow::Error> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("Credential store mutex poisoned: {}", e))?;
        Ok(match users.get_mut(&id) {
            Some(user) => {
                apply(user);
                user.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, anyhow::Error> {
        self.find(|u| u.email == email)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>, anyhow::Error> {
        self.find(|u| u.id == id)
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, anyhow::Error> {
        self.find(|u| u.phone.as_deref() == Some(phone))
    }

    async fn create(&self, user: NewUser) -> Result<User, CredentialError> {
        let mut users = self
            .users
            .lock()
            .map_err(|e| anyhow::anyhow!("Credential store mutex poisoned: {}", e))?;

        if users.values().any(|u| u.email == user.email) {
            return Err(CredentialError::DuplicateEmail);
        }
        if user.phone.is_some() && users.values().any(|u| u.phone == user.phone) {
            return Err(CredentialError::DuplicatePhone);
        }

        let id = users.keys().next_back().map_or(1, |last| last + 1);
        let now = Utc::now();
        let created = User {
            id,
            email: user.email,
            password_hash: user.password_hash,
            phone: user.phone,
            email_verified: false,
            phone_verified: false,
            created_at: now,
            updated_at: now,
        };
        users.insert(id, created.clone());
        Ok(created)
    }

    async fn mark_email_verified(&self, id: i64) -> Result<bool, anyhow::Error> {
        self.update(id, |u| u.email_verified = true)
    }

    async fn mark_phone_verified(&self, id: i64) -> Result<bool, anyhow::Error> {
        self.update(id, |u| u.phone_verified = true)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
