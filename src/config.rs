//! Configuration types for cns-dns.

use hickory_proto::rr::Name;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::DnsError;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "CNS_DNS";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Record store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a TOML file with `CNS_DNS__*` environment overrides,
    /// then normalize and validate it.
    pub fn load(path: &Path) -> Result<Self, DnsError> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.dns.normalize();
        config.dns.validate()?;
        Ok(config)
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// This server's own DNS name, used as the SOA mname and apex NS.
    pub my_name: String,

    /// Hostmaster mailbox, either `user@domain` or already in DNS form.
    pub hostmaster: String,

    /// Forward zones served, keyed by zone name.
    #[serde(default)]
    pub forward_zones: BTreeMap<String, ZoneConfig>,

    /// Settings shared by every discovered reverse zone.
    #[serde(default)]
    pub reverse_zones: ZoneConfig,

    /// Extra transfer ACL entries (IP, CIDR or hostname).
    #[serde(default)]
    pub allow_transfer: Vec<String>,

    /// Also publish instance and service names under the owner's login.
    #[serde(default)]
    pub use_login: bool,

    /// Also publish instance names under the holder's alias.
    #[serde(default)]
    pub use_alias: bool,

    /// TTL for leaf records in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// TTL for apex NS records in seconds.
    #[serde(default = "default_ns_ttl")]
    pub ns_ttl: u32,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,

    /// Background timer configuration.
    #[serde(default)]
    pub timers: TimerConfig,
}

/// Per-zone replication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Leave this server out of the apex NS set.
    #[serde(default, alias = "hidden_master")]
    pub hidden_primary: bool,

    /// Secondary nameservers for this zone (hostnames or addresses).
    #[serde(default, alias = "slaves")]
    pub peers: Vec<String>,
}

impl ZoneConfig {
    /// Peers that can be advertised as NS targets. Address and network
    /// literals are transfer peers only.
    pub fn ns_peers(&self) -> impl Iterator<Item = &str> {
        self.peers
            .iter()
            .map(String::as_str)
            .filter(|peer| peer.parse::<IpNetwork>().is_err())
    }

    fn check_hidden_primary(&self, what: &str) -> Result<(), DnsError> {
        if self.hidden_primary && self.ns_peers().next().is_none() {
            return Err(DnsError::Config(format!(
                "{} is a hidden primary but has no peer hostname to advertise as NS",
                what
            )));
        }
        Ok(())
    }
}

impl DnsConfig {
    /// Lower-case zone names and strip trailing dots so lookups can compare
    /// names directly.
    pub fn normalize(&mut self) {
        let zones = std::mem::take(&mut self.forward_zones);
        self.forward_zones = zones
            .into_iter()
            .map(|(name, zone)| (normalize_name(&name), zone))
            .collect();
        self.my_name = normalize_name(&self.my_name);
    }

    /// Check the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<(), DnsError> {
        if self.my_name.is_empty() {
            return Err(DnsError::Config("my_name must be set".to_string()));
        }
        Name::from_ascii(&self.my_name)
            .map_err(|e| DnsError::Config(format!("my_name {:?}: {}", self.my_name, e)))?;

        if self.hostmaster.is_empty() {
            return Err(DnsError::Config("hostmaster must be set".to_string()));
        }
        Name::from_ascii(self.hostmaster_rname())
            .map_err(|e| DnsError::Config(format!("hostmaster {:?}: {}", self.hostmaster, e)))?;

        if self.forward_zones.is_empty() {
            return Err(DnsError::Config(
                "at least one forward zone must be configured".to_string(),
            ));
        }

        for (name, zone) in &self.forward_zones {
            Name::from_ascii(name)
                .map_err(|e| DnsError::Config(format!("zone {:?}: {}", name, e)))?;
            zone.check_hidden_primary(&format!("zone {}", name))?;
        }
        self.reverse_zones.check_hidden_primary("reverse zones")?;

        Ok(())
    }

    /// Replication settings for a zone: the forward zone's own entry, or the
    /// shared reverse zone entry for `.arpa` zones.
    pub fn zone_config(&self, zone: &str) -> Option<&ZoneConfig> {
        if let Some(config) = self.forward_zones.get(zone) {
            return Some(config);
        }
        if zone.ends_with(".arpa") {
            return Some(&self.reverse_zones);
        }
        None
    }

    /// Hostmaster mailbox in DNS form (`user@example.com` becomes
    /// `user.example.com`).
    pub fn hostmaster_rname(&self) -> String {
        self.hostmaster.replacen('@', ".", 1)
    }

    /// Every peer name across all zones, deduplicated.
    pub fn all_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .forward_zones
            .values()
            .chain(std::iter::once(&self.reverse_zones))
            .flat_map(|zone| zone.peers.iter().cloned())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }
}

/// Lower-case a DNS name and strip any trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Record store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL (e.g. `redis://127.0.0.1:6379/0`). Without one the server
    /// keeps its records in process memory.
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// Timers for the commit engine and peer maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Seconds an automatically opened serial stays open before it commits.
    #[serde(default = "default_serial_close_delay")]
    pub serial_close_delay_secs: u64,

    /// Seconds between NOTIFY and garbage collection sweeps.
    #[serde(default = "default_notify_interval")]
    pub notify_interval_secs: u64,

    /// Seconds to wait after a transfer before probing the peer.
    #[serde(default = "default_probe_delay")]
    pub probe_delay_secs: u64,

    /// Milliseconds to wait for a peer's reply to a NOTIFY or probe.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// Seconds a peer stays blacklisted after repeated NOTIFY failures.
    #[serde(default = "default_blacklist_cooldown")]
    pub blacklist_cooldown_secs: u64,
}

impl TimerConfig {
    /// Auto-close delay for timed serials.
    pub fn serial_close_delay(&self) -> Duration {
        Duration::from_secs(self.serial_close_delay_secs)
    }

    /// Interval between maintenance sweeps.
    pub fn notify_interval(&self) -> Duration {
        Duration::from_secs(self.notify_interval_secs)
    }

    /// Delay before post-transfer probes.
    pub fn probe_delay(&self) -> Duration {
        Duration::from_secs(self.probe_delay_secs)
    }

    /// Timeout for a single peer exchange.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Blacklist cooldown.
    pub fn blacklist_cooldown(&self) -> Duration {
        Duration::from_secs(self.blacklist_cooldown_secs)
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            serial_close_delay_secs: default_serial_close_delay(),
            notify_interval_secs: default_notify_interval(),
            probe_delay_secs: default_probe_delay(),
            peer_timeout_ms: default_peer_timeout(),
            blacklist_cooldown_secs: default_blacklist_cooldown(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "cns_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

/// SOA (Start of Authority) timing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum (negative caching) TTL in seconds, also the SOA record's own TTL.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0u16; 8], 53))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ttl() -> u32 {
    30
}

fn default_ns_ttl() -> u32 {
    3600
}

fn default_refresh() -> u32 {
    60
}

fn default_retry() -> u32 {
    60
}

fn default_expire() -> u32 {
    181440
}

fn default_minimum() -> u32 {
    60
}

fn default_serial_close_delay() -> u64 {
    10
}

fn default_notify_interval() -> u64 {
    10
}

fn default_probe_delay() -> u64 {
    5
}

fn default_peer_timeout() -> u64 {
    2000
}

fn default_blacklist_cooldown() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DnsConfig {
        DnsConfig {
            listen_addr: default_listen_addr(),
            my_name: "ns0.example.com".to_string(),
            hostmaster: "hostmaster@example.com".to_string(),
            forward_zones: BTreeMap::from([("Foo.".to_string(), ZoneConfig::default())]),
            reverse_zones: ZoneConfig::default(),
            allow_transfer: vec![],
            use_login: false,
            use_alias: false,
            ttl: default_ttl(),
            ns_ttl: default_ns_ttl(),
            soa: SoaConfig::default(),
            timers: TimerConfig::default(),
        }
    }

    #[test]
    fn test_normalize_lowercases_zones() {
        let mut config = base_config();
        config.normalize();
        assert!(config.forward_zones.contains_key("foo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hidden_primary_requires_peers() {
        let mut config = base_config();
        config.forward_zones.insert(
            "bar".to_string(),
            ZoneConfig {
                hidden_primary: true,
                peers: vec![],
            },
        );
        config.normalize();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hidden primary"));
    }

    #[test]
    fn test_hidden_primary_needs_peer_hostname() {
        let mut config = base_config();
        config.forward_zones.insert(
            "bar".to_string(),
            ZoneConfig {
                hidden_primary: true,
                peers: vec!["10.0.0.9".to_string(), "fd00::9".to_string()],
            },
        );
        config.normalize();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("zone bar"));

        config.forward_zones.get_mut("bar").unwrap().peers.push("ns1.bar".to_string());
        assert!(config.validate().is_ok());

        config.reverse_zones = ZoneConfig {
            hidden_primary: true,
            peers: vec!["10.0.0.9".to_string()],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reverse zones"));
    }

    #[test]
    fn test_hostmaster_rname() {
        let config = base_config();
        assert_eq!(config.hostmaster_rname(), "hostmaster.example.com");
    }

    #[test]
    fn test_zone_config_for_reverse_zone() {
        let mut config = base_config();
        config.reverse_zones.peers = vec!["10.0.0.2".to_string()];
        config.normalize();
        let reverse = config.zone_config("3.2.1.in-addr.arpa").unwrap();
        assert_eq!(reverse.peers, vec!["10.0.0.2".to_string()]);
        assert!(config.zone_config("unknown").is_none());
    }

    #[test]
    fn test_deserialize_with_legacy_names() {
        let toml = r#"
            my_name = "ns0.example.com"
            hostmaster = "hostmaster@example.com"

            [forward_zones.foo]
            hidden_master = true
            slaves = ["10.0.0.2"]
        "#;
        let config: DnsConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let zone = &config.forward_zones["foo"];
        assert!(zone.hidden_primary);
        assert_eq!(zone.peers, vec!["10.0.0.2".to_string()]);
        assert_eq!(config.ttl, 30);
        assert_eq!(config.timers.serial_close_delay(), Duration::from_secs(10));
    }
}
