//! Mapping from a holder (VM) description to the records it should publish.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::trace;

use crate::error::DnsError;
use crate::record::{RecordData, ZoneRecord};

/// Labels at or beyond this length are not published.
const MAX_LABEL: usize = 63;

/// Records of one zone, keyed by leaf name.
pub type NameRecords = BTreeMap<String, Vec<ZoneRecord>>;

/// Records of every zone a holder touches, keyed by zone.
pub type ZoneRecords = BTreeMap<String, NameRecords>;

/// A VM as delivered by the discovery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    /// Holder identifier.
    pub uuid: String,
    /// Owning account.
    pub owner: Owner,
    /// Optional human-readable alias.
    #[serde(default)]
    pub alias: Option<String>,
    /// Services this holder takes part in.
    #[serde(default)]
    pub services: Vec<Service>,
    /// Network interfaces.
    #[serde(default)]
    pub nics: Vec<Nic>,
    /// Publish any records at all for this holder.
    #[serde(default = "default_true", alias = "listInstance")]
    pub list_instance: bool,
    /// Publish service records for this holder.
    #[serde(default = "default_true", alias = "listServices")]
    pub list_services: bool,
    /// Explicit PTR target overriding the derived instance name.
    #[serde(default)]
    pub ptrname: Option<String>,
}

/// Account owning a holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    /// Account identifier.
    pub uuid: String,
    /// Account login name.
    #[serde(default)]
    pub login: Option<String>,
}

/// A named service, optionally with ports to advertise through SRV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ServiceInput")]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Ports to advertise.
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServiceInput {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        ports: Vec<u16>,
    },
}

impl From<ServiceInput> for Service {
    fn from(input: ServiceInput) -> Self {
        match input {
            ServiceInput::Name(name) => Service {
                name,
                ports: Vec::new(),
            },
            ServiceInput::Full { name, ports } => Service { name, ports },
        }
    }
}

/// A network interface and the zones its addresses are published in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    /// Single address, used when `ips` is empty.
    #[serde(default)]
    pub ip: Option<String>,
    /// Addresses, optionally with a `/prefix` suffix.
    #[serde(default)]
    pub ips: Vec<String>,
    /// Forward zones to publish in.
    #[serde(default)]
    pub zones: Vec<String>,
}

impl Nic {
    fn addresses(&self) -> impl Iterator<Item = &str> {
        let single = if self.ips.is_empty() {
            self.ip.as_deref()
        } else {
            None
        };
        self.ips.iter().map(String::as_str).chain(single)
    }
}

fn default_true() -> bool {
    true
}

/// Naming switches taken from the server configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Naming {
    /// Also publish under the owner's login.
    pub use_login: bool,
    /// Also publish under the holder's alias.
    pub use_alias: bool,
}

/// Lower-case and replace runs of characters outside `[a-z0-9-]` with `-`.
pub fn dnsify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}

/// Reverse zone and leaf name for an address.
///
/// IPv4 uses the last octet as the leaf under `<c>.<b>.<a>.in-addr.arpa`;
/// IPv6 uses the low 16 nibbles under the high 16 nibbles in `ip6.arpa`.
pub fn reverse_zone_ip(ip: IpAddr) -> (String, String) {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            (d.to_string(), format!("{}.{}.{}.in-addr.arpa", c, b, a))
        }
        IpAddr::V6(v6) => {
            let nibbles: Vec<String> = v6
                .octets()
                .iter()
                .rev()
                .flat_map(|byte| [byte & 0x0f, byte >> 4])
                .map(|n| format!("{:x}", n))
                .collect();
            (
                nibbles[..16].join("."),
                format!("{}.ip6.arpa", nibbles[16..].join(".")),
            )
        }
    }
}

fn parse_address(raw: &str) -> Result<Option<IpAddr>, DnsError> {
    let ip = raw.split('/').next().unwrap_or(raw);
    if ip == "dhcp" || ip == "addrconf" {
        return Ok(None);
    }
    ip.parse()
        .map(Some)
        .map_err(|_| DnsError::InvalidAddress(format!("unknown address type: {}", raw)))
}

fn address_record(ip: IpAddr) -> RecordData {
    match ip {
        IpAddr::V4(v4) => RecordData::A(v4),
        IpAddr::V6(v6) => RecordData::AAAA(v6),
    }
}

fn push_unique(records: &mut Vec<ZoneRecord>, record: ZoneRecord) {
    if !records.iter().any(|r| r.data == record.data && r.src == record.src) {
        records.push(record);
    }
}

/// Every record a holder should publish, grouped by zone and leaf name.
pub fn build_zones(holder: &Holder, naming: Naming) -> Result<ZoneRecords, DnsError> {
    let mut zones = ZoneRecords::new();

    for nic in &holder.nics {
        for raw in nic.addresses() {
            let Some(ip) = parse_address(raw)? else {
                trace!(holder = %holder.uuid, address = raw, "skipping address without a fixed IP");
                continue;
            };

            for zone in &nic.zones {
                add_instance(&mut zones, holder, naming, ip, zone);
                if holder.list_services {
                    for service in &holder.services {
                        add_service(&mut zones, holder, naming, ip, zone, service);
                    }
                }
            }
        }
    }

    Ok(zones)
}

fn login_label(holder: &Holder) -> Option<String> {
    holder
        .owner
        .login
        .as_deref()
        .filter(|login| login.len() < MAX_LABEL)
        .map(dnsify)
}

fn alias_label(holder: &Holder) -> Option<String> {
    holder
        .alias
        .as_deref()
        .filter(|alias| alias.len() < MAX_LABEL)
        .map(dnsify)
}

fn add_instance(zones: &mut ZoneRecords, holder: &Holder, naming: Naming, ip: IpAddr, zone: &str) {
    let login = login_label(holder).filter(|_| naming.use_login);
    let alias = alias_label(holder).filter(|_| naming.use_alias);

    let mut names = vec![format!("{}.inst.{}", holder.uuid, holder.owner.uuid)];
    let mut reverse_name = names[0].clone();
    if let Some(login) = &login {
        names.push(format!("{}.inst.{}", holder.uuid, login));
    }
    if let Some(alias) = &alias {
        reverse_name = format!("{}.inst.{}", alias, holder.owner.uuid);
        names.push(reverse_name.clone());
        if let Some(login) = &login {
            reverse_name = format!("{}.inst.{}", alias, login);
            names.push(reverse_name.clone());
        }
    }

    let zone_names = zones.entry(zone.to_string()).or_default();
    for name in names {
        let records = zone_names.entry(name).or_default();
        push_unique(records, ZoneRecord::new(address_record(ip)));
        if !records.iter().any(|r| matches!(r.data, RecordData::TXT(_))) {
            records.push(ZoneRecord::new(RecordData::TXT(holder.uuid.clone())));
        }
    }

    let target = holder
        .ptrname
        .clone()
        .unwrap_or_else(|| format!("{}.{}", reverse_name, zone));
    let (leaf, reverse_zone) = reverse_zone_ip(ip);
    let records = zones
        .entry(reverse_zone)
        .or_default()
        .entry(leaf)
        .or_default();
    push_unique(records, ZoneRecord::new(RecordData::PTR(target)));
}

fn add_service(
    zones: &mut ZoneRecords,
    holder: &Holder,
    naming: Naming,
    ip: IpAddr,
    zone: &str,
    service: &Service,
) {
    let service_name = dnsify(&service.name);
    let mut names = vec![format!("{}.svc.{}", service_name, holder.owner.uuid)];
    if let Some(login) = login_label(holder).filter(|_| naming.use_login) {
        names.push(format!("{}.svc.{}", service_name, login));
    }

    let target = format!("{}.inst.{}.{}", holder.uuid, holder.owner.uuid, zone);
    let zone_names = zones.entry(zone.to_string()).or_default();
    for name in names {
        let records = zone_names.entry(name).or_default();
        push_unique(
            records,
            ZoneRecord::new(address_record(ip)).with_src(&holder.uuid),
        );
        let has_txt = records
            .iter()
            .any(|r| r.data == RecordData::TXT(holder.uuid.clone()));
        if !has_txt {
            records.push(ZoneRecord::new(RecordData::TXT(holder.uuid.clone())).with_src(&holder.uuid));
        }
        for port in &service.ports {
            push_unique(
                records,
                ZoneRecord::new(RecordData::srv(target.clone(), *port)).with_src(&holder.uuid),
            );
        }
    }
}
