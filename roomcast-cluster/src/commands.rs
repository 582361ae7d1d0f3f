//! Typed command surface
//!
//! Thin wrappers over the cluster connection. Every command is bounded by
//! the configured command timeout and gated on connection state (see
//! [`ClusterManager::command_connection`](crate::manager::ClusterManager)):
//! fail fast with `NotReady` before the first connection, attempted in
//! `Degraded` with errors surfaced to the caller, refused with
//! `NotConnected` after shutdown.
//!
//! Individual command failures never affect connection state.

use redis::AsyncCommands;

use crate::error::ClusterError;
use crate::manager::ClusterManager;

impl ClusterManager {
    /// GET. Returns `None` for a missing key.
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.get(key)).await
    }

    /// SET.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.set(key, value)).await
    }

    /// SETEX: SET with a TTL in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.set_ex(key, value, ttl_secs)).await
    }

    /// DEL. Returns the number of keys removed.
    pub async fn del(&self, key: &str) -> Result<u32, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.del(key)).await
    }

    /// EXISTS.
    pub async fn exists(&self, key: &str) -> Result<bool, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.exists(key)).await
    }

    /// EXPIRE. Returns false if the key does not exist.
    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<bool, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async(&mut conn),
        )
        .await
    }

    /// MGET. Result order matches `keys`; missing keys yield `None`.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.mget(keys)).await
    }

    /// MSET.
    pub async fn mset(&self, pairs: &[(String, String)]) -> Result<(), ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.set_multiple(pairs)).await
    }

    /// INCRBY. Returns the new value.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.incr(key, delta)).await
    }

    /// DECRBY. Returns the new value.
    pub async fn decr(&self, key: &str, delta: i64) -> Result<i64, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.decr(key, delta)).await
    }

    /// SADD. Returns the number of members added.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<u32, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.sadd(key, member)).await
    }

    /// SMEMBERS.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.smembers(key)).await
    }

    /// SREM. Returns the number of members removed.
    pub async fn srem(&self, key: &str, member: &str) -> Result<u32, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.srem(key, member)).await
    }

    /// PING. Returns true on PONG.
    pub async fn ping(&self) -> Result<bool, ClusterError> {
        let mut conn = self.command_connection().await?;
        let pong: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(pong == "PONG")
    }

    /// PUBLISH. Returns the number of subscribers that received the message.
    ///
    /// An ordinary command, usable on any non-subscriber connection; the
    /// fanout adapter's publisher role routes through this.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u32, ClusterError> {
        let mut conn = self.command_connection().await?;
        self.bounded(conn.publish(channel, payload)).await
    }

    /// Applies the command timeout and error mapping to one redis future.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, ClusterError> {
        let limit = self.config.command_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ClusterError::Timeout(limit))?
            .map_err(ClusterError::from)
    }
}
