//! Zone resolution: which zone, if any, a query name belongs to.

use std::sync::Arc;

use crate::error::DnsError;
use crate::store::{keys, RecordStore};

/// Forward zones from configuration plus reverse zones discovered in the
/// store.
#[derive(Clone)]
pub struct ZoneIndex {
    forward: Arc<Vec<String>>,
    store: Arc<dyn RecordStore>,
}

/// Whether `name` is `zone` itself or lies below it on a label boundary.
pub fn in_zone(name: &str, zone: &str) -> bool {
    name == zone
        || (name.len() > zone.len()
            && name.ends_with(zone)
            && name.as_bytes()[name.len() - zone.len() - 1] == b'.')
}

/// Leaf part of `name` relative to `zone`; the apex is the empty string.
pub fn leaf<'a>(name: &'a str, zone: &str) -> &'a str {
    if name.len() <= zone.len() {
        return "";
    }
    &name[..name.len() - zone.len() - 1]
}

fn longest_match<'a>(name: &str, zones: impl IntoIterator<Item = &'a String>) -> Option<&'a String> {
    zones
        .into_iter()
        .filter(|zone| in_zone(name, zone))
        .max_by_key(|zone| zone.len())
}

impl ZoneIndex {
    /// Build an index over the configured forward zones.
    pub fn new(forward: impl IntoIterator<Item = String>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            forward: Arc::new(forward.into_iter().collect()),
            store,
        }
    }

    /// Configured forward zones.
    pub fn forward_zones(&self) -> &[String] {
        &self.forward
    }

    /// Reverse zones that have records in the store.
    pub async fn reverse_zones(&self) -> Result<Vec<String>, DnsError> {
        let prefix = keys::zone("");
        Ok(self
            .store
            .keys(keys::REVERSE_ZONES)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .filter(|zone| !zone.contains(':'))
            .collect())
    }

    /// Every zone served: forward zones first, then reverse zones.
    pub async fn all_zones(&self) -> Result<Vec<String>, DnsError> {
        let mut zones: Vec<String> = self.forward.iter().cloned().collect();
        zones.extend(self.reverse_zones().await?);
        Ok(zones)
    }

    /// Longest configured forward zone containing `name`.
    pub fn forward_zone(&self, name: &str) -> Option<&str> {
        longest_match(name, self.forward.iter()).map(String::as_str)
    }

    /// Most specific zone for a normalized (lower-case, no trailing dot)
    /// name. Reverse zones are consulted only for `.arpa` names with no
    /// forward match.
    pub async fn find_zone(&self, name: &str) -> Result<Option<String>, DnsError> {
        if let Some(zone) = self.forward_zone(name) {
            return Ok(Some(zone.to_string()));
        }
        if !name.ends_with(".arpa") {
            return Ok(None);
        }
        let reverse = self.reverse_zones().await?;
        Ok(longest_match(name, reverse.iter()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn index(store: Arc<MemoryStore>) -> ZoneIndex {
        ZoneIndex::new(
            ["foo".to_string(), "sub.foo".to_string(), "example.com".to_string()],
            store,
        )
    }

    #[test]
    fn test_in_zone_is_label_aligned() {
        assert!(in_zone("a.foo", "foo"));
        assert!(in_zone("foo", "foo"));
        assert!(!in_zone("afoo", "foo"));
        assert!(!in_zone("oo", "foo"));
    }

    #[test]
    fn test_leaf() {
        assert_eq!(leaf("abc.inst.def.foo", "foo"), "abc.inst.def");
        assert_eq!(leaf("foo", "foo"), "");
    }

    #[tokio::test]
    async fn test_longest_forward_zone_wins() {
        let idx = index(Arc::new(MemoryStore::new()));
        assert_eq!(idx.find_zone("x.sub.foo").await.unwrap().as_deref(), Some("sub.foo"));
        assert_eq!(idx.find_zone("x.foo").await.unwrap().as_deref(), Some("foo"));
        assert_eq!(idx.find_zone("x.bar").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reverse_zone_discovery() {
        let store = Arc::new(MemoryStore::new());
        store.hset("zone:3.2.1.in-addr.arpa", "4", "[]").await.unwrap();
        store.set("zone:3.2.1.in-addr.arpa:latest", "2").await.unwrap();
        let idx = index(store);

        assert_eq!(idx.reverse_zones().await.unwrap(), vec!["3.2.1.in-addr.arpa"]);
        assert_eq!(
            idx.find_zone("4.3.2.1.in-addr.arpa").await.unwrap().as_deref(),
            Some("3.2.1.in-addr.arpa")
        );
        assert_eq!(idx.find_zone("4.3.2.9.in-addr.arpa").await.unwrap(), None);
        assert_eq!(idx.all_zones().await.unwrap().len(), 4);
    }
}
