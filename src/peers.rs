//! Transfer peers: who may transfer zones, and what each peer last confirmed.

use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::error::DnsError;
use crate::store::{keys, RecordStore};

/// Map IPv4-mapped IPv6 addresses back to IPv4 so they match IPv4 entries.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Addresses and networks allowed to transfer zones and read privileged
/// metadata.
#[derive(Debug, Clone)]
pub struct PeerAcl {
    entries: Vec<IpNetwork>,
}

impl Default for PeerAcl {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerAcl {
    /// An ACL holding only the loopback addresses.
    pub fn new() -> Self {
        Self {
            entries: vec![
                IpNetwork::from(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                IpNetwork::from(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            ],
        }
    }

    /// Build the ACL from `allow_transfer` and every zone's peers, resolving
    /// hostnames. Unresolvable names are logged and skipped.
    pub async fn from_config(config: &DnsConfig) -> Self {
        let mut acl = Self::new();
        for entry in config.allow_transfer.iter().chain(config.all_peers().iter()) {
            if let Err(e) = acl.add_resolved(entry).await {
                warn!(peer = %entry, error = %e, "could not add transfer peer");
            }
        }
        info!(entries = acl.entries.len(), "transfer ACL ready");
        acl
    }

    /// Add an IP address or CIDR block. Returns false when `entry` is
    /// neither.
    pub fn add(&mut self, entry: &str) -> bool {
        let parsed = entry
            .parse::<IpAddr>()
            .map(|ip| IpNetwork::from(canonical_ip(ip)))
            .or_else(|_| entry.parse::<IpNetwork>());
        match parsed {
            Ok(network) => {
                self.push(network);
                true
            }
            Err(_) => false,
        }
    }

    /// Add an address, CIDR block or hostname (every resolved address).
    pub async fn add_resolved(&mut self, entry: &str) -> Result<(), DnsError> {
        if self.add(entry) {
            return Ok(());
        }
        let resolved = tokio::net::lookup_host((entry, 53)).await?;
        let mut any = false;
        for addr in resolved {
            debug!(peer = %entry, addr = %addr.ip(), "resolved transfer peer");
            self.push(IpNetwork::from(canonical_ip(addr.ip())));
            any = true;
        }
        if !any {
            return Err(DnsError::InvalidAddress(format!("{} resolved to nothing", entry)));
        }
        Ok(())
    }

    fn push(&mut self, network: IpNetwork) {
        if !self.entries.contains(&network) {
            self.entries.push(network);
        }
    }

    /// Whether `ip` falls inside an entry of the same address family.
    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = canonical_ip(ip);
        self.entries.iter().any(|network| network.contains(ip))
    }

    /// ACL entries in insertion order.
    pub fn entries(&self) -> &[IpNetwork] {
        &self.entries
    }
}

/// Persisted per-peer bookkeeping (`peer:<addr>` and `peer:<addr>:version`).
#[derive(Clone)]
pub struct PeerBook {
    store: Arc<dyn RecordStore>,
}

const VERSION_SUFFIX: &str = ":version";

impl PeerBook {
    /// Bookkeeping over `store`.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Record that `peer` holds `serial` of `zone`.
    pub async fn record_serial(&self, peer: &str, zone: &str, serial: u32) -> Result<(), DnsError> {
        self.store
            .hset(&keys::peer(peer), zone, &serial.to_string())
            .await
    }

    /// Record the version string `peer` reported.
    pub async fn record_version(&self, peer: &str, version: &str) -> Result<(), DnsError> {
        self.store.set(&keys::peer_version(peer), version).await
    }

    /// Version string `peer` last reported.
    pub async fn version(&self, peer: &str) -> Result<Option<String>, DnsError> {
        self.store.get(&keys::peer_version(peer)).await
    }

    /// Zones and serials `peer` has confirmed.
    pub async fn serials(&self, peer: &str) -> Result<BTreeMap<String, u32>, DnsError> {
        let mut out = BTreeMap::new();
        for (zone, raw) in self.store.hgetall(&keys::peer(peer)).await? {
            match raw.parse() {
                Ok(serial) => {
                    out.insert(zone, serial);
                }
                Err(_) => warn!(peer, zone = %zone, value = %raw, "ignoring non-numeric peer serial"),
            }
        }
        Ok(out)
    }

    /// Every peer that has confirmed at least one serial.
    pub async fn peers(&self) -> Result<Vec<String>, DnsError> {
        let prefix = keys::peer("");
        Ok(self
            .store
            .keys(keys::PEERS)
            .await?
            .into_iter()
            .filter(|key| !key.ends_with(VERSION_SUFFIX))
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Confirmed serials of every tracked peer.
    pub async fn all_serials(&self) -> Result<BTreeMap<String, BTreeMap<String, u32>>, DnsError> {
        let mut out = BTreeMap::new();
        for peer in self.peers().await? {
            let serials = self.serials(&peer).await?;
            out.insert(peer, serials);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_loopback_always_allowed() {
        let acl = PeerAcl::new();
        assert!(acl.allows("127.0.0.1".parse().unwrap()));
        assert!(acl.allows("::1".parse().unwrap()));
        assert!(!acl.allows("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ip_and_cidr_entries() {
        let mut acl = PeerAcl::new();
        assert!(acl.add("10.0.0.2"));
        assert!(acl.add("192.168.0.0/16"));
        assert!(acl.add("fd00::/64"));
        assert!(!acl.add("ns1.example.com"));

        assert!(acl.allows("10.0.0.2".parse().unwrap()));
        assert!(!acl.allows("10.0.0.3".parse().unwrap()));
        assert!(acl.allows("192.168.44.1".parse().unwrap()));
        assert!(acl.allows("fd00::1234".parse().unwrap()));
        assert!(!acl.allows("fd01::1".parse().unwrap()));
        // IPv4-mapped sources match IPv4 entries
        assert!(acl.allows("::ffff:10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_duplicate_entries_collapse() {
        let mut acl = PeerAcl::new();
        acl.add("10.0.0.2");
        acl.add("10.0.0.2");
        assert_eq!(acl.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_peer_book() {
        let store = Arc::new(MemoryStore::new());
        let book = PeerBook::new(store.clone());
        book.record_serial("10.0.0.2", "foo", 5).await.unwrap();
        book.record_serial("10.0.0.2", "bar", 6).await.unwrap();
        book.record_serial("fd00::2", "foo", 7).await.unwrap();
        book.record_version("fd00::2", "BIND 9").await.unwrap();
        store.hset("peer:10.0.0.2", "baz", "junk").await.unwrap();

        assert_eq!(book.peers().await.unwrap(), vec!["10.0.0.2", "fd00::2"]);
        let all = book.all_serials().await.unwrap();
        assert_eq!(all["10.0.0.2"].len(), 2);
        assert_eq!(all["fd00::2"]["foo"], 7);
        assert_eq!(book.version("fd00::2").await.unwrap().as_deref(), Some("BIND 9"));
    }
}
