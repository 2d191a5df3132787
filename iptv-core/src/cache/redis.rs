use std::fmt;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::Client;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CacheError, CacheResult, FastCache};

/// Redis backed cache. Every call is bounded by `timeout`; a failed call drops
/// the shared connection so the next one reconnects.
pub struct RedisCache {
    client: Client,
    timeout: Duration,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisCache {
    pub fn open(url: &str, timeout: Duration) -> CacheResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            timeout,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T, F, Fut>(&self, op: F) -> CacheResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, ::redis::RedisError>>,
    {
        let result = tokio::time::timeout(self.timeout, async {
            let conn = self.connection().await?;
            op(conn).await.map_err(CacheError::from)
        })
        .await
        .unwrap_or(Err(CacheError::Timeout(self.timeout)));
        if let Err(error) = &result {
            debug!(%error, "redis call failed, dropping connection");
            *self.connection.lock().await = None;
        }
        result
    }
}

#[async_trait::async_trait]
impl FastCache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.bounded(|mut conn| async move {
            ::redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let seconds = ttl.as_secs().max(1);
        self.bounded(|mut conn| async move {
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(seconds)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.bounded(|mut conn| async move {
            ::redis::cmd("INCR").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn push_job(&self, queue: &str, payload: &str) -> CacheResult<()> {
        self.bounded(|mut conn| async move {
            let _: i64 = ::redis::cmd("RPUSH")
                .arg(queue)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn pop_job(&self, queue: &str) -> CacheResult<Option<String>> {
        self.bounded(|mut conn| async move {
            ::redis::cmd("LPOP").arg(queue).query_async(&mut conn).await
        })
        .await
    }
}
