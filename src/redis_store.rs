//! Redis-backed record store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{BTreeMap, HashMap};

use crate::error::DnsError;
use crate::store::RecordStore;

/// Record store talking to Redis over a reconnecting multiplexed connection.
///
/// Cloning is cheap; every clone shares the same connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, DnsError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DnsError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), DnsError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), DnsError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, DnsError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys(pattern).await?;
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, DnsError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), DnsError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, DnsError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), DnsError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, DnsError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<(), DnsError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(key, 0, value).await?;
        Ok(())
    }
}
