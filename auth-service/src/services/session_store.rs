//! Device session persistence.
//!
//! Redis layout, per user `U` and device `D`:
//! - `auth:device:{U}:D` hash holding the session fields, expiring at `expire_at`;
//! - `auth:user-devices:{U}` set of device ids with a live session.
//!
//! The braces are Redis Cluster hash tags, so every key of one user lands in
//! the same slot and the Lua scripts below may touch them together.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{aio::ConnectionManager, Script};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{DeviceSession, SessionRotation};
use crate::services::redis::bounded;

#[async_trait]
pub trait DeviceSessionStore: Send + Sync {
    async fn get(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<DeviceSession>, anyhow::Error>;

    /// Full upsert of the (user, device) session.
    async fn save(&self, session: &DeviceSession) -> Result<(), anyhow::Error>;

    /// Compare-and-set on the jti: overwrite the rotating fields of the session
    /// and clear `is_revoked`, but only while it still holds `expected_jti`.
    ///
    /// Returns `false` without writing anything if the session is gone or was
    /// rebound to another token.
    async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        expected_jti: &str,
        rotation: &SessionRotation,
    ) -> Result<bool, anyhow::Error>;

    async fn revoke(&self, user_id: i64, device_id: &str) -> Result<(), anyhow::Error>;

    /// Drop every session of the user at once. Returns how many were removed.
    async fn revoke_all(&self, user_id: i64) -> Result<usize, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

pub fn session_key(user_id: i64, device_id: &str) -> String {
    format!("auth:device:{{{}}}:{}", user_id, device_id)
}

pub fn index_key(user_id: i64) -> String {
    format!("auth:user-devices:{{{}}}", user_id)
}

/// Seconds until `expire_at`, rounded up, never below one.
pub fn ttl_seconds(expire_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (expire_at - now).num_milliseconds();
    ((millis + 999) / 1000).max(1)
}

// KEYS: session, index. ARGV: ttl, device id, field/value pairs...
const SAVE_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
if redis.call('TTL', KEYS[2]) < tonumber(ARGV[1]) then
  redis.call('EXPIRE', KEYS[2], ARGV[1])
end
return 1
"#;

// KEYS: session, index. ARGV: ttl, device id, expected jti, field/value pairs...
// HGET on a missing key yields false, so a missing session is left missing.
const ROTATE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'jti') ~= ARGV[3] then
  return 0
end
redis.call('HDEL', KEYS[1], 'ip', 'user_agent')
redis.call('HSET', KEYS[1], unpack(ARGV, 4))
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
if redis.call('TTL', KEYS[2]) < tonumber(ARGV[1]) then
  redis.call('EXPIRE', KEYS[2], ARGV[1])
end
return 1
"#;

// KEYS: index. ARGV: session key prefix.
const REVOKE_ALL_SCRIPT: &str = r#"
local devices = redis.call('SMEMBERS', KEYS[1])
for _, device in ipairs(devices) do
  redis.call('DEL', ARGV[1] .. device)
end
redis.call('DEL', KEYS[1])
return #devices
"#;

pub struct RedisSessionStore {
    manager: ConnectionManager,
    save_script: Script,
    rotate_script: Script,
    revoke_all_script: Script,
}

impl RedisSessionStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            save_script: Script::new(SAVE_SCRIPT),
            rotate_script: Script::new(ROTATE_SCRIPT),
            revoke_all_script: Script::new(REVOKE_ALL_SCRIPT),
        }
    }
}

fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn from_millis(raw: Option<&String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn session_fields(session: &DeviceSession) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("user_id", session.user_id.to_string()),
        ("device_id", session.device_id.clone()),
        ("jti", session.jti.clone()),
        ("refresh_token_hash", session.refresh_token_hash.clone()),
        ("is_revoked", if session.is_revoked { "1" } else { "0" }.to_string()),
        ("last_used_at", millis(session.last_used_at)),
        ("expire_at", millis(session.expire_at)),
    ];
    if let Some(ip) = &session.ip {
        fields.push(("ip", ip.clone()));
    }
    if let Some(user_agent) = &session.user_agent {
        fields.push(("user_agent", user_agent.clone()));
    }
    fields
}

fn rotation_fields(rotation: &SessionRotation) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("jti", rotation.jti.clone()),
        ("refresh_token_hash", rotation.refresh_token_hash.clone()),
        ("is_revoked", "0".to_string()),
        ("last_used_at", millis(rotation.last_used_at)),
        ("expire_at", millis(rotation.expire_at)),
    ];
    if let Some(ip) = &rotation.ip {
        fields.push(("ip", ip.clone()));
    }
    if let Some(user_agent) = &rotation.user_agent {
        fields.push(("user_agent", user_agent.clone()));
    }
    fields
}

fn parse_session(
    user_id: i64,
    device_id: &str,
    fields: &HashMap<String, String>,
) -> Option<DeviceSession> {
    Some(DeviceSession {
        user_id,
        device_id: device_id.to_string(),
        jti: fields.get("jti")?.clone(),
        refresh_token_hash: fields.get("refresh_token_hash")?.clone(),
        is_revoked: fields.get("is_revoked").map(String::as_str) == Some("1"),
        last_used_at: from_millis(fields.get("last_used_at"))?,
        expire_at: from_millis(fields.get("expire_at"))?,
        ip: fields.get("ip").cloned(),
        user_agent: fields.get("user_agent").cloned(),
    })
}

#[async_trait]
impl DeviceSessionStore for RedisSessionStore {
    async fn get(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<DeviceSession>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = session_key(user_id, device_id);

        let fields: HashMap<String, String> = bounded(
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn),
            "HGETALL session",
        )
        .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let session = parse_session(user_id, device_id, &fields);
        if session.is_none() {
            tracing::warn!(user_id, device_id, "Unreadable session record, treating as absent");
        }
        Ok(session)
    }

    async fn save(&self, session: &DeviceSession) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let ttl = ttl_seconds(session.expire_at, Utc::now());

        let mut invocation = self.save_script.prepare_invoke();
        invocation
            .key(session_key(session.user_id, &session.device_id))
            .key(index_key(session.user_id))
            .arg(ttl)
            .arg(&session.device_id);
        for (field, value) in session_fields(session) {
            invocation.arg(field).arg(value);
        }

        bounded(
            invocation.invoke_async::<_, i64>(&mut conn),
            "save session",
        )
        .await?;
        Ok(())
    }

    async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        expected_jti: &str,
        rotation: &SessionRotation,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let ttl = ttl_seconds(rotation.expire_at, Utc::now());

        let mut invocation = self.rotate_script.prepare_invoke();
        invocation
            .key(session_key(user_id, device_id))
            .key(index_key(user_id))
            .arg(ttl)
            .arg(device_id)
            .arg(expected_jti);
        for (field, value) in rotation_fields(rotation) {
            invocation.arg(field).arg(value);
        }

        let applied: i64 = bounded(
            invocation.invoke_async(&mut conn),
            "rotate session",
        )
        .await?;
        Ok(applied == 1)
    }

    async fn revoke(&self, user_id: i64, device_id: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();

        bounded(
            redis::pipe()
                .atomic()
                .del(session_key(user_id, device_id))
                .ignore()
                .srem(index_key(user_id), device_id)
                .ignore()
                .query_async::<_, ()>(&mut conn),
            "revoke session",
        )
        .await?;
        Ok(())
    }

    async fn revoke_all(&self, user_id: i64) -> Result<usize, anyhow::Error> {
        let mut conn = self.manager.clone();
        let prefix = format!("auth:device:{{{}}}:", user_id);

        let removed: i64 = bounded(
            self.revoke_all_script
                .key(index_key(user_id))
                .arg(prefix)
                .invoke_async(&mut conn),
            "revoke all sessions",
        )
        .await?;
        Ok(removed.max(0) as usize)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        bounded(
            redis::cmd("PING").query_async::<_, String>(&mut conn),
            "PING",
        )
        .await
        .map(|_| ())
    }
}

/// In-process session store.
///
/// Sessions are never reclaimed on expiry here; the session manager's own
/// `expire_at` check is what rejects them.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<(i64, String), DeviceSession>>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(i64, String), DeviceSession>>, anyhow::Error>
    {
        self.sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Session store mutex poisoned: {}", e))
    }

    /// Number of live sessions for a user.
    pub fn count_for(&self, user_id: i64) -> usize {
        self.lock()
            .map(|sessions| sessions.keys().filter(|(uid, _)| *uid == user_id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DeviceSessionStore for InMemorySessionStore {
    async fn get(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<DeviceSession>, anyhow::Error> {
        Ok(self.lock()?.get(&(user_id, device_id.to_string())).cloned())
    }

    async fn save(&self, session: &DeviceSession) -> Result<(), anyhow::Error> {
        self.lock()?.insert(
            (session.user_id, session.device_id.clone()),
            session.clone(),
        );
        Ok(())
    }

    async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        expected_jti: &str,
        rotation: &SessionRotation,
    ) -> Result<bool, anyhow::Error> {
        let mut sessions = self.lock()?;
        let Some(session) = sessions.get_mut(&(user_id, device_id.to_string())) else {
            return Ok(false);
        };
        if session.jti != expected_jti {
            return Ok(false);
        }

        session.jti = rotation.jti.clone();
        session.refresh_token_hash = rotation.refresh_token_hash.clone();
        session.is_revoked = false;
        session.last_used_at = rotation.last_used_at;
        session.expire_at = rotation.expire_at;
        session.ip = rotation.ip.clone();
        session.user_agent = rotation.user_agent.clone();
        Ok(true)
    }

    async fn revoke(&self, user_id: i64, device_id: &str) -> Result<(), anyhow::Error> {
        self.lock()?.remove(&(user_id, device_id.to_string()));
        Ok(())
    }

    async fn revoke_all(&self, user_id: i64) -> Result<usize, anyhow::Error> {
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|(uid, _), _| *uid != user_id);
        Ok(before - sessions.len())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(user_id: i64, device_id: &str, jti: &str) -> DeviceSession {
        let now = Utc::now();
        DeviceSession {
            user_id,
            device_id: device_id.to_string(),
            jti: jti.to_string(),
            refresh_token_hash: format!("hash-{}", jti),
            is_revoked: false,
            last_used_at: now,
            expire_at: now + Duration::days(30),
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
        }
    }

    fn rotation(jti: &str) -> SessionRotation {
        let now = Utc::now();
        SessionRotation {
            jti: jti.to_string(),
            refresh_token_hash: format!("hash-{}", jti),
            last_used_at: now,
            expire_at: now + Duration::days(30),
            ip: None,
            user_agent: Some("curl".to_string()),
        }
    }

    #[test]
    fn keys_share_a_hash_tag() {
        assert_eq!(session_key(7, "abc"), "auth:device:{7}:abc");
        assert_eq!(index_key(7), "auth:user-devices:{7}");
    }

    #[test]
    fn ttl_rounds_up_and_is_at_least_one_second() {
        let now = Utc::now();
        assert_eq!(ttl_seconds(now + Duration::milliseconds(1500), now), 2);
        assert_eq!(ttl_seconds(now + Duration::seconds(60), now), 60);
        assert_eq!(ttl_seconds(now - Duration::seconds(5), now), 1);
    }

    #[test]
    fn redis_fields_parse_back() {
        let original = session(3, "d1", "j1");
        let fields: HashMap<String, String> = session_fields(&original)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let parsed = parse_session(3, "d1", &fields).unwrap();
        assert_eq!(parsed.jti, "j1");
        assert_eq!(parsed.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(
            parsed.expire_at.timestamp_millis(),
            original.expire_at.timestamp_millis()
        );
        assert!(parse_session(3, "d1", &HashMap::new()).is_none());
    }

    #[tokio::test]
    async fn save_overwrites_per_device() {
        let store = InMemorySessionStore::new();
        store.save(&session(1, "d1", "a")).await.unwrap();
        store.save(&session(1, "d1", "b")).await.unwrap();
        store.save(&session(1, "d2", "c")).await.unwrap();

        assert_eq!(store.get(1, "d1").await.unwrap().unwrap().jti, "b");
        assert_eq!(store.count_for(1), 2);
    }

    #[tokio::test]
    async fn rotate_updates_existing_and_skips_missing() {
        let store = InMemorySessionStore::new();
        let mut revoked = session(1, "d1", "a");
        revoked.is_revoked = true;
        store.save(&revoked).await.unwrap();

        assert!(store.rotate(1, "d1", "a", &rotation("b")).await.unwrap());
        let rotated = store.get(1, "d1").await.unwrap().unwrap();
        assert_eq!(rotated.jti, "b");
        assert!(!rotated.is_revoked);
        assert_eq!(rotated.user_agent.as_deref(), Some("curl"));

        assert!(!store.rotate(1, "d9", "a", &rotation("c")).await.unwrap());
        assert!(store.get(1, "d9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotate_refuses_a_session_rebound_to_another_jti() {
        let store = InMemorySessionStore::new();
        store.save(&session(1, "d1", "old")).await.unwrap();
        // A fresh login on the same device replaced the session.
        store.save(&session(1, "d1", "fresh")).await.unwrap();

        assert!(!store.rotate(1, "d1", "old", &rotation("stale")).await.unwrap());
        let kept = store.get(1, "d1").await.unwrap().unwrap();
        assert_eq!(kept.jti, "fresh");
        assert_eq!(kept.refresh_token_hash, "hash-fresh");
        assert_eq!(kept.ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn revoke_and_revoke_all_scope() {
        let store = InMemorySessionStore::new();
        store.save(&session(1, "d1", "a")).await.unwrap();
        store.save(&session(1, "d2", "b")).await.unwrap();
        store.save(&session(2, "d1", "c")).await.unwrap();

        store.revoke(1, "d1").await.unwrap();
        assert!(store.get(1, "d1").await.unwrap().is_none());
        assert!(store.get(1, "d2").await.unwrap().is_some());

        assert_eq!(store.revoke_all(1).await.unwrap(), 1);
        assert_eq!(store.count_for(1), 0);
        assert!(store.get(2, "d1").await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_store_lifecycle() {
        let url = std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis = crate::services::RedisService::new(&crate::config::RedisConfig { url })
            .await
            .unwrap();
        let store = RedisSessionStore::new(redis.manager());
        let user_id = i64::from(rand::random::<u32>()) + 1_000_000;

        store.save(&session(user_id, "d1", "a")).await.unwrap();
        store.save(&session(user_id, "d2", "b")).await.unwrap();
        assert_eq!(store.get(user_id, "d1").await.unwrap().unwrap().jti, "a");

        assert!(store.rotate(user_id, "d1", "a", &rotation("a2")).await.unwrap());
        let rotated = store.get(user_id, "d1").await.unwrap().unwrap();
        assert_eq!(rotated.jti, "a2");
        assert!(rotated.ip.is_none());

        assert!(!store.rotate(user_id, "d1", "a", &rotation("a3")).await.unwrap());
        assert_eq!(store.get(user_id, "d1").await.unwrap().unwrap().jti, "a2");

        store.revoke(user_id, "d1").await.unwrap();
        assert!(!store.rotate(user_id, "d1", "a2", &rotation("a3")).await.unwrap());
        assert!(store.get(user_id, "d1").await.unwrap().is_none());

        assert_eq!(store.revoke_all(user_id).await.unwrap(), 1);
        assert!(store.get(user_id, "d2").await.unwrap().is_none());
    }
}
