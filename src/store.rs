//! Record store adapter.
//!
//! Every piece of zone state lives in an external key/value service with
//! string, hash and list primitives. [`RecordStore`] is the seam; the server
//! talks to Redis in production ([`crate::redis_store::RedisStore`]) and to
//! [`MemoryStore`] in tests or when no Redis URL is configured.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::DnsError;
use crate::redis_store::RedisStore;

/// Key/value primitives needed by the zone builder, query path and peer
/// bookkeeping.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, DnsError>;

    /// Write a string value.
    async fn set(&self, key: &str, value: &str) -> Result<(), DnsError>;

    /// Delete a key of any type.
    async fn del(&self, key: &str) -> Result<(), DnsError>;

    /// List keys matching a glob pattern (`*` wildcards only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, DnsError>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, DnsError>;

    /// Write one hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), DnsError>;

    /// Read a whole hash.
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, DnsError>;

    /// Append to a list.
    async fn rpush(&self, key: &str, value: &str) -> Result<(), DnsError>;

    /// Read a whole list.
    async fn lrange(&self, key: &str) -> Result<Vec<String>, DnsError>;

    /// Remove every occurrence of a value from a list.
    async fn lrem(&self, key: &str, value: &str) -> Result<(), DnsError>;
}

/// Build the configured store: Redis when a URL is given, memory otherwise.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn RecordStore>, DnsError> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            info!(url = %url, "connected to redis record store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no redis_url configured, records are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Key layout shared with other consumers of the same store.
pub mod keys {
    /// Hash of leaf name to JSON record list.
    pub fn zone(zone: &str) -> String {
        format!("zone:{}", zone)
    }

    /// Latest committed serial of a zone.
    pub fn latest(zone: &str) -> String {
        format!("zone:{}:latest", zone)
    }

    /// Ordered list of every committed serial of a zone.
    pub fn history(zone: &str) -> String {
        format!("zone:{}:all", zone)
    }

    /// Additions made between two adjacent serials.
    pub fn diff_add(zone: &str, from: u32, to: u32) -> String {
        format!("zone:{}:{}:{}:add", zone, from, to)
    }

    /// Removals made between two adjacent serials.
    pub fn diff_remove(zone: &str, from: u32, to: u32) -> String {
        format!("zone:{}:{}:{}:remove", zone, from, to)
    }

    /// Pattern matching every discovered reverse zone hash.
    pub const REVERSE_ZONES: &str = "zone:*.arpa";

    /// Hash of zone to the serial a peer last confirmed.
    pub fn peer(addr: &str) -> String {
        format!("peer:{}", addr)
    }

    /// Version string a peer reported.
    pub fn peer_version(addr: &str) -> String {
        format!("peer:{}:version", addr)
    }

    /// Pattern matching every peer key.
    pub const PEERS: &str = "peer:*";

    /// Per-holder bookkeeping hash.
    pub fn holder(uuid: &str) -> String {
        format!("vm:{}", uuid)
    }

    /// Field holding a holder's last published records.
    pub const LAST_RECS: &str = "last_recs";

    /// Field holding the unix time of a holder's last update.
    pub const LAST_VISIT: &str = "last_visit";
}

/// Read and parse `zone:<z>:latest`.
pub async fn latest_serial(store: &dyn RecordStore, zone: &str) -> Result<Option<u32>, DnsError> {
    match store.get(&keys::latest(zone)).await? {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| DnsError::Store(format!("{} holds non-numeric serial {:?}", keys::latest(zone), raw))),
        None => Ok(None),
    }
}

/// Read and parse `zone:<z>:all`.
pub async fn serial_history(store: &dyn RecordStore, zone: &str) -> Result<Vec<u32>, DnsError> {
    store
        .lrange(&keys::history(zone))
        .await?
        .into_iter()
        .map(|raw| {
            raw.parse().map_err(|_| {
                DnsError::Store(format!("{} holds non-numeric serial {:?}", keys::history(zone), raw))
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
    List(Vec<String>),
}

/// Thread-safe in-process store with the same semantics as the Redis backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Value>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, as a disconnected backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn check(&self) -> Result<(), DnsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DnsError::Store("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> DnsError {
    DnsError::Store(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Match `key` against a glob pattern where `*` matches any run of characters.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DnsError> {
        self.check()?;
        match self.inner.read().get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), DnsError> {
        self.check()?;
        self.inner
            .write()
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), DnsError> {
        self.check()?;
        if self.inner.write().remove(key).is_some() {
            debug!(key, "deleted key");
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, DnsError> {
        self.check()?;
        let mut keys: Vec<String> = self
            .inner
            .read()
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, DnsError> {
        self.check()?;
        match self.inner.read().get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), DnsError> {
        self.check()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(BTreeMap::new()));
        match entry {
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, DnsError> {
        self.check()?;
        match self.inner.read().get(key) {
            None => Ok(BTreeMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), DnsError> {
        self.check()?;
        let mut inner = self.inner.write();
        let entry = inner
            .entry(key.to_string())
            .or_insert_with(|| Value::List(Vec::new()));
        match entry {
            Value::List(l) => {
                l.push(value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, DnsError> {
        self.check()?;
        match self.inner.read().get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(l)) => Ok(l.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<(), DnsError> {
        self.check()?;
        let mut inner = self.inner.write();
        let emptied = match inner.get_mut(key) {
            None => return Ok(()),
            Some(Value::List(l)) => {
                l.retain(|v| v != value);
                l.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        // Redis drops a list once its last element goes.
        if emptied {
            inner.remove(key);
        }
        Ok(())
    }
}
