//! One refresh-token session per (user, device).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Persisted state binding a user's device to the refresh token it may use next.
///
/// Only the SHA-256 of the raw refresh token is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub user_id: i64,
    pub device_id: String,
    /// `jti` of the only refresh token this session will accept.
    pub jti: String,
    pub refresh_token_hash: String,
    pub is_revoked: bool,
    pub last_used_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at < now
    }

    /// Compare a presented raw token against the stored hash in constant time.
    pub fn matches_token(&self, raw_token: &str) -> bool {
        let presented = hash_token(raw_token);
        presented
            .as_bytes()
            .ct_eq(self.refresh_token_hash.as_bytes())
            .into()
    }
}

/// Fields overwritten when a session's refresh token is rotated.
#[derive(Debug, Clone)]
pub struct SessionRotation {
    pub jti: String,
    pub refresh_token_hash: String,
    pub last_used_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Hex-encoded SHA-256 of a raw token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(raw_token: &str) -> DeviceSession {
        let now = Utc::now();
        DeviceSession {
            user_id: 1,
            device_id: "d1".to_string(),
            jti: "jti-1".to_string(),
            refresh_token_hash: hash_token(raw_token),
            is_revoked: false,
            last_used_at: now,
            expire_at: now + Duration::days(30),
            ip: None,
            user_agent: None,
        }
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = hash_token("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn matches_only_the_issued_token() {
        let s = session("token-a");
        assert!(s.matches_token("token-a"));
        assert!(!s.matches_token("token-b"));
    }

    #[test]
    fn expiry_is_strictly_after_expire_at() {
        let s = session("t");
        assert!(!s.is_expired_at(s.expire_at));
        assert!(s.is_expired_at(s.expire_at + Duration::seconds(1)));
    }
}
