//! Resource records as they are stored and served.
//!
//! Records are persisted as JSON objects of the shape
//! `{"constructor": "A", "args": ["10.0.0.1"], "src": "...", "id": "..."}`.
//! [`ZoneRecord`] decodes that shape into a typed [`RecordData`] and converts
//! it into hickory wire records on the way out.

use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, PTR, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::DnsError;

/// Default SRV priority when the stored record carries no options.
pub const DEFAULT_SRV_PRIORITY: u16 = 0;
/// Default SRV weight when the stored record carries no options.
pub const DEFAULT_SRV_WEIGHT: u16 = 10;

/// Typed record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// IPv4 address.
    A(Ipv4Addr),
    /// IPv6 address.
    AAAA(Ipv6Addr),
    /// Delegated nameserver.
    NS(String),
    /// Canonical name.
    CNAME(String),
    /// Reverse pointer.
    PTR(String),
    /// Single text string.
    TXT(String),
    /// Service location.
    SRV {
        /// Target host.
        target: String,
        /// Target port.
        port: u16,
        /// Priority (lower is preferred).
        priority: u16,
        /// Relative weight among equal priorities.
        weight: u16,
    },
}

impl RecordData {
    /// Stored constructor name of this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordData::A(_) => "A",
            RecordData::AAAA(_) => "AAAA",
            RecordData::NS(_) => "NS",
            RecordData::CNAME(_) => "CNAME",
            RecordData::PTR(_) => "PTR",
            RecordData::TXT(_) => "TXT",
            RecordData::SRV { .. } => "SRV",
        }
    }

    /// DNS type of this kind.
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::AAAA(_) => RecordType::AAAA,
            RecordData::NS(_) => RecordType::NS,
            RecordData::CNAME(_) => RecordType::CNAME,
            RecordData::PTR(_) => RecordType::PTR,
            RecordData::TXT(_) => RecordType::TXT,
            RecordData::SRV { .. } => RecordType::SRV,
        }
    }

    /// Build an SRV payload with default priority and weight.
    pub fn srv(target: impl Into<String>, port: u16) -> Self {
        RecordData::SRV {
            target: target.into(),
            port,
            priority: DEFAULT_SRV_PRIORITY,
            weight: DEFAULT_SRV_WEIGHT,
        }
    }

    fn args(&self) -> Vec<Value> {
        match self {
            RecordData::A(ip) => vec![json!(ip.to_string())],
            RecordData::AAAA(ip) => vec![json!(ip.to_string())],
            RecordData::NS(target)
            | RecordData::CNAME(target)
            | RecordData::PTR(target)
            | RecordData::TXT(target) => vec![json!(target)],
            RecordData::SRV {
                target,
                port,
                priority,
                weight,
            } => {
                let mut args = vec![json!(target), json!(port)];
                if *priority != DEFAULT_SRV_PRIORITY || *weight != DEFAULT_SRV_WEIGHT {
                    args.push(json!({ "priority": priority, "weight": weight }));
                }
                args
            }
        }
    }

    fn from_parts(kind: &str, args: &[Value]) -> Result<Self, DnsError> {
        let text = |i: usize| -> Result<&str, DnsError> {
            args.get(i).and_then(Value::as_str).ok_or_else(|| {
                DnsError::InvalidRecord(format!("{} argument {} must be a string", kind, i))
            })
        };

        match kind {
            "A" => text(0)?
                .parse()
                .map(RecordData::A)
                .map_err(|_| DnsError::InvalidRecord(format!("bad A address {:?}", args[0]))),
            "AAAA" => text(0)?
                .parse()
                .map(RecordData::AAAA)
                .map_err(|_| DnsError::InvalidRecord(format!("bad AAAA address {:?}", args[0]))),
            "NS" => Ok(RecordData::NS(text(0)?.to_string())),
            "CNAME" => Ok(RecordData::CNAME(text(0)?.to_string())),
            "PTR" => Ok(RecordData::PTR(text(0)?.to_string())),
            "TXT" => Ok(RecordData::TXT(text(0)?.to_string())),
            "SRV" => {
                let target = text(0)?.to_string();
                let port = args
                    .get(1)
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| DnsError::InvalidRecord("SRV port must be a u16".to_string()))?;
                let opt = |field: &str, default: u16| -> Result<u16, DnsError> {
                    match args.get(2).and_then(|o| o.get(field)) {
                        None => Ok(default),
                        Some(v) => v.as_u64().and_then(|v| u16::try_from(v).ok()).ok_or_else(
                            || DnsError::InvalidRecord(format!("SRV {} must be a u16", field)),
                        ),
                    }
                };
                Ok(RecordData::SRV {
                    target,
                    port,
                    priority: opt("priority", DEFAULT_SRV_PRIORITY)?,
                    weight: opt("weight", DEFAULT_SRV_WEIGHT)?,
                })
            }
            other => Err(DnsError::InvalidRecord(format!(
                "unknown record kind {:?}",
                other
            ))),
        }
    }

    /// Convert to hickory wire data.
    pub fn to_rdata(&self) -> Result<RData, DnsError> {
        Ok(match self {
            RecordData::A(ip) => RData::A(A::from(*ip)),
            RecordData::AAAA(ip) => RData::AAAA(AAAA::from(*ip)),
            RecordData::NS(target) => RData::NS(NS(fqdn(target)?)),
            RecordData::CNAME(target) => RData::CNAME(CNAME(fqdn(target)?)),
            RecordData::PTR(target) => RData::PTR(PTR(fqdn(target)?)),
            RecordData::TXT(text) => RData::TXT(TXT::new(vec![text.clone()])),
            RecordData::SRV {
                target,
                port,
                priority,
                weight,
            } => RData::SRV(SRV::new(*priority, *weight, *port, fqdn(target)?)),
        })
    }
}

/// Parse a name and mark it fully qualified.
pub fn fqdn(name: &str) -> Result<Name, DnsError> {
    let mut name = Name::from_ascii(name.trim_end_matches('.'))?;
    name.set_fqdn(true);
    Ok(name)
}

#[derive(Serialize, Deserialize)]
struct RawRecord {
    constructor: String,
    args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

/// A stored resource record: payload plus the holder that owns it and a
/// stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord", into = "RawRecord")]
pub struct ZoneRecord {
    /// Typed payload.
    pub data: RecordData,
    /// Holder that owns this record, for records shared between holders.
    pub src: Option<String>,
    /// Stable identifier, assigned when the record is first added.
    pub id: Option<String>,
}

impl TryFrom<RawRecord> for ZoneRecord {
    type Error = DnsError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        Ok(ZoneRecord {
            data: RecordData::from_parts(&raw.constructor, &raw.args)?,
            src: raw.src,
            id: raw.id,
        })
    }
}

impl From<ZoneRecord> for RawRecord {
    fn from(record: ZoneRecord) -> Self {
        RawRecord {
            constructor: record.data.kind().to_string(),
            args: record.data.args(),
            src: record.src,
            id: record.id,
        }
    }
}

impl ZoneRecord {
    /// A record with no owner and no id yet.
    pub fn new(data: RecordData) -> Self {
        Self {
            data,
            src: None,
            id: None,
        }
    }

    /// Set the owning holder.
    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    /// Two records match when their ids are equal, or when their kind and
    /// arguments are equal.
    pub fn matches(&self, other: &ZoneRecord) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            if a == b {
                return true;
            }
        }
        self.data == other.data
    }

    /// Build the wire record for `owner`.
    pub fn to_record(&self, owner: &Name, ttl: u32) -> Result<Record, DnsError> {
        let mut record = Record::from_rdata(owner.clone(), ttl, self.data.to_rdata()?);
        record.set_dns_class(DNSClass::IN);
        Ok(record)
    }
}

/// One entry of a stored diff list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Leaf name within the zone.
    pub name: String,
    /// The record that was added or removed.
    pub record: ZoneRecord,
}

/// Decode a stored JSON record list.
pub fn decode_list(raw: &str) -> Result<Vec<ZoneRecord>, DnsError> {
    Ok(serde_json::from_str(raw)?)
}

/// Encode a record list for storage.
pub fn encode_list(records: &[ZoneRecord]) -> Result<String, DnsError> {
    Ok(serde_json::to_string(records)?)
}
