//! Append-only log of authentication events, newest first on read.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, streams::StreamRangeReply};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::models::AuthEvent;
use crate::services::redis::bounded;

pub const EVENT_STREAM_KEY: &str = "auth:events";
/// Approximate cap on retained events.
pub const EVENT_STREAM_MAX_LEN: usize = 10_000;

#[async_trait]
pub trait AuthEventLog: Send + Sync {
    async fn log(&self, event: &AuthEvent) -> Result<(), anyhow::Error>;
    async fn recent(&self, limit: usize) -> Result<Vec<AuthEvent>, anyhow::Error>;

    /// Newest events attributed to `user_id`, searched within the retained window.
    async fn recent_for_user(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<AuthEvent>, anyhow::Error>;
}

/// Redis stream backed log (`XADD MAXLEN ~` / `XREVRANGE`).
pub struct RedisAuthEventLog {
    manager: ConnectionManager,
}

impl RedisAuthEventLog {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AuthEventLog for RedisAuthEventLog {
    async fn log(&self, event: &AuthEvent) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(EVENT_STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(EVENT_STREAM_MAX_LEN)
            .arg("*");
        for (field, value) in event.to_fields() {
            cmd.arg(field).arg(value);
        }

        bounded(cmd.query_async::<_, String>(&mut conn), "XADD auth event").await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuthEvent>, anyhow::Error> {
        self.read_newest(limit).await
    }

    async fn recent_for_user(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<AuthEvent>, anyhow::Error> {
        let events = self.read_newest(EVENT_STREAM_MAX_LEN).await?;
        Ok(events
            .into_iter()
            .filter(|event| event.user_id == Some(user_id))
            .take(limit)
            .collect())
    }
}

impl RedisAuthEventLog {
    async fn read_newest(&self, count: usize) -> Result<Vec<AuthEvent>, anyhow::Error> {
        let mut conn = self.manager.clone();

        let reply: StreamRangeReply = bounded(
            redis::cmd("XREVRANGE")
                .arg(EVENT_STREAM_KEY)
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn),
            "XREVRANGE auth events",
        )
        .await?;

        Ok(reply
            .ids
            .into_iter()
            .filter_map(|entry| {
                let fields: HashMap<String, String> = entry
                    .map
                    .iter()
                    .filter_map(|(k, v)| {
                        redis::from_redis_value::<String>(v)
                            .ok()
                            .map(|s| (k.clone(), s))
                    })
                    .collect();
                AuthEvent::from_fields(entry.id, &fields)
            })
            .collect())
    }
}

/// Bounded in-process log.
pub struct InMemoryAuthEventLog {
    inner: Mutex<(u64, VecDeque<AuthEvent>)>,
}

impl Default for InMemoryAuthEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuthEventLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((0, VecDeque::new())),
        }
    }
}

#[async_trait]
impl AuthEventLog for InMemoryAuthEventLog {
    async fn log(&self, event: &AuthEvent) -> Result<(), anyhow::Error> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Event log mutex poisoned: {}", e))?;
        let (seq, events) = &mut *guard;

        *seq += 1;
        let mut event = event.clone();
        event.id = Some(format!("{}-0", seq));
        events.push_back(event);
        while events.len() > EVENT_STREAM_MAX_LEN {
            events.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuthEvent>, anyhow::Error> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Event log mutex poisoned: {}", e))?;
        Ok(guard.1.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_for_user(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<AuthEvent>, anyhow::Error> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Event log mutex poisoned: {}", e))?;
        Ok(guard
            .1
            .iter()
            .rev()
            .filter(|event| event.user_id == Some(user_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthEventKind;

    #[tokio::test]
    async fn recent_returns_newest_first() {
        let log = InMemoryAuthEventLog::new();
        log.log(&AuthEvent::new(AuthEventKind::LoginSuccess).user(1))
            .await
            .unwrap();
        log.log(&AuthEvent::new(AuthEventKind::RefreshSuccess).user(1))
            .await
            .unwrap();
        log.log(&AuthEvent::new(AuthEventKind::Logout).user(1))
            .await
            .unwrap();

        let events = log.recent(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuthEventKind::Logout);
        assert_eq!(events[0].id.as_deref(), Some("3-0"));
        assert_eq!(events[1].kind, AuthEventKind::RefreshSuccess);
    }

    #[tokio::test]
    async fn per_user_view_skips_other_users() {
        let log = InMemoryAuthEventLog::new();
        log.log(&AuthEvent::new(AuthEventKind::LoginSuccess).user(1))
            .await
            .unwrap();
        log.log(&AuthEvent::new(AuthEventKind::LoginSuccess).user(2).email("b@x.com"))
            .await
            .unwrap();
        log.log(&AuthEvent::new(AuthEventKind::LoginFail).email("a@x.com"))
            .await
            .unwrap();
        log.log(&AuthEvent::new(AuthEventKind::Logout).user(1))
            .await
            .unwrap();

        let mine = log.recent_for_user(1, 10).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].kind, AuthEventKind::Logout);
        assert!(mine.iter().all(|e| e.user_id == Some(1)));

        assert_eq!(log.recent_for_user(1, 1).await.unwrap().len(), 1);
        assert!(log.recent_for_user(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_is_bounded() {
        let log = InMemoryAuthEventLog::new();
        for _ in 0..EVENT_STREAM_MAX_LEN + 5 {
            log.log(&AuthEvent::new(AuthEventKind::LoginFail))
                .await
                .unwrap();
        }
        assert_eq!(
            log.recent(usize::MAX).await.unwrap().len(),
            EVENT_STREAM_MAX_LEN
        );
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_stream_round_trip() {
        let url = std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis = crate::services::RedisService::new(&crate::config::RedisConfig { url })
            .await
            .unwrap();
        let log = RedisAuthEventLog::new(redis.manager());

        log.log(&AuthEvent::new(AuthEventKind::LoginFail).reason("INVALID_CREDENTIALS"))
            .await
            .unwrap();
        let events = log.recent(1).await.unwrap();
        assert_eq!(events[0].kind, AuthEventKind::LoginFail);
        assert!(events[0].id.is_some());

        let user_id = i64::from(rand::random::<u32>()) + 1_000_000;
        log.log(&AuthEvent::new(AuthEventKind::Logout).user(user_id))
            .await
            .unwrap();
        let mine = log.recent_for_user(user_id, 5).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].kind, AuthEventKind::Logout);
    }
}
