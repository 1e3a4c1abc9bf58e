// Warden — KV store client.
// Short-term state, counters, and pub/sub over Redis. The connection manager
// is established lazily and re-used; every operation runs under a 5-second
// timeout so a wedged store degrades instead of hanging the pipeline.

use std::future::Future;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;

use crate::error::{CoreError, CoreResult};

const OP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KvStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl KvStore {
    pub fn new(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::Infra(format!("invalid redis url: {e}")))?;
        Ok(Self { client, manager: OnceCell::new() })
    }

    async fn manager(&self) -> CoreResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                // Bounded connect retries — the startup gate owns the long
                // wait loop, steady-state ops must fail fast instead.
                let config = ConnectionManagerConfig::new()
                    .set_number_of_retries(3)
                    .set_connection_timeout(Duration::from_secs(2));
                tokio::time::timeout(
                    OP_TIMEOUT,
                    self.client.get_connection_manager_with_config(config),
                )
                .await
                .map_err(|_| CoreError::Infra("kv connect timed out".into()))?
                .map_err(|e| CoreError::Infra(format!("kv connect failed: {e}")))
            })
            .await?;
        Ok(manager.clone())
    }

    async fn op<T, F>(&self, what: &str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(OP_TIMEOUT, fut)
            .await
            .map_err(|_| CoreError::Infra(format!("kv {what} timed out")))?
            .map_err(|e| CoreError::Infra(format!("kv {what} failed: {e}")))
    }

    pub async fn ping(&self) -> bool {
        let Ok(mut con) = self.manager().await else { return false };
        self.op("ping", async move {
            redis::cmd("PING").query_async::<String>(&mut con).await
        })
        .await
        .is_ok()
    }

    /// Block until the store answers, or give up after `retries` attempts.
    pub async fn wait_until_ready(&self, retries: u32, delay: Duration) -> bool {
        for attempt in 1..=retries {
            if self.ping().await {
                tracing::info!("kv: connected (attempt {})", attempt);
                return true;
            }
            tracing::warn!("kv: not ready, attempt {}/{}", attempt, retries);
            tokio::time::sleep(delay).await;
        }
        false
    }

    pub async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut con = self.manager().await?;
        let key = key.to_string();
        self.op("get", async move { con.get(&key).await }).await
    }

    pub async fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let mut con = self.manager().await?;
        let (key, value) = (key.to_string(), value.to_string());
        self.op("set", async move { con.set(&key, &value).await }).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> CoreResult<()> {
        let mut con = self.manager().await?;
        let (key, value) = (key.to_string(), value.to_string());
        self.op("set_ex", async move { con.set_ex(&key, &value, ttl_secs).await })
            .await
    }

    pub async fn del(&self, key: &str) -> CoreResult<()> {
        let mut con = self.manager().await?;
        let key = key.to_string();
        self.op("del", async move { con.del(&key).await }).await
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> CoreResult<i64> {
        let mut con = self.manager().await?;
        let key = key.to_string();
        self.op("incr", async move { con.incr(&key, delta).await }).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> CoreResult<()> {
        let mut con = self.manager().await?;
        let (channel, payload) = (channel.to_string(), payload.to_string());
        self.op("publish", async move { con.publish(&channel, &payload).await })
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> CoreResult<()> {
        self.set(key, &serde_json::to_string(value)?).await
    }

    pub async fn set_json_ex<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> CoreResult<()> {
        self.set_ex(key, &serde_json::to_string(value)?, ttl_secs).await
    }

    /// `used_memory` from INFO, in MiB. Used by the maintenance snapshot.
    pub async fn info_memory_mb(&self) -> CoreResult<u64> {
        let mut con = self.manager().await?;
        let raw = self
            .op("info", async move {
                redis::cmd("INFO").arg("memory").query_async::<String>(&mut con).await
            })
            .await?;
        let used = raw
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Ok(used / (1024 * 1024))
    }
}
