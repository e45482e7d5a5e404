use redis::{aio::ConnectionManager, Client, RedisResult};
use std::future::Future;
use std::time::Duration;

/// Upper bound for a single Redis round trip before the store is treated as unavailable.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared Redis connection used by the session, verification and event-log stores.
#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own after a dropped connection.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get Redis connection manager");
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        bounded(
            redis::cmd("PING").query_async::<_, String>(&mut conn),
            "health check",
        )
        .await
        .map(|_| ())
    }
}

/// Run a Redis call under `COMMAND_TIMEOUT`, folding timeouts and errors into `anyhow`.
pub async fn bounded<T, F>(fut: F, what: &str) -> Result<T, anyhow::Error>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(anyhow::anyhow!("Redis {} failed: {}", what, e)),
        Err(_) => Err(anyhow::anyhow!(
            "Redis {} timed out after {:?}",
            what,
            COMMAND_TIMEOUT
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_reports_timeouts() {
        tokio::time::pause();
        let never = std::future::pending::<RedisResult<()>>();
        let err = bounded(never, "GET").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn bounded_passes_values_through() {
        let ready = async { RedisResult::Ok(5) };
        assert_eq!(bounded(ready, "GET").await.unwrap(), 5);
    }
}
