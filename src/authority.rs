//! Zone authority: synthesized SOA/NS records and access to stored names.

use hickory_proto::rr::rdata::{NS, SOA};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::DnsConfig;
use crate::error::DnsError;
use crate::record::{decode_list, fqdn, ZoneRecord};
use crate::serial::current_serial;
use crate::store::{self, keys, RecordStore};
use crate::zones::ZoneIndex;

/// Everything the query and transfer paths need to know about served zones.
pub struct ZoneAuthority {
    config: Arc<DnsConfig>,
    store: Arc<dyn RecordStore>,
    index: ZoneIndex,
}

impl ZoneAuthority {
    /// Create an authority for the configured zones backed by `store`.
    pub fn new(config: Arc<DnsConfig>, store: Arc<dyn RecordStore>) -> Self {
        let index = ZoneIndex::new(config.forward_zones.keys().cloned(), store.clone());
        Self {
            config,
            store,
            index,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Zone index.
    pub fn index(&self) -> &ZoneIndex {
        &self.index
    }

    /// Latest committed serial of `zone`, or the current clock serial for a
    /// zone that has never been committed.
    pub async fn latest_serial(&self, zone: &str) -> Result<u32, DnsError> {
        match store::latest_serial(self.store.as_ref(), zone).await? {
            Some(serial) => Ok(serial),
            None => {
                debug!(zone, "zone has no committed serial, using clock serial");
                Ok(current_serial())
            }
        }
    }

    /// Owner name for `leaf` in `zone`.
    pub fn owner_name(leaf: &str, zone: &str) -> Result<Name, DnsError> {
        if leaf.is_empty() {
            fqdn(zone)
        } else {
            fqdn(&format!("{}.{}", leaf, zone))
        }
    }

    /// Synthesized SOA record for `zone` carrying `serial`.
    pub fn soa_record(&self, zone: &str, serial: u32) -> Result<Record, DnsError> {
        let soa = &self.config.soa;
        let rdata = SOA::new(
            fqdn(&self.config.my_name)?,
            fqdn(&self.config.hostmaster_rname())?,
            serial,
            soa.refresh as i32,
            soa.retry as i32,
            soa.expire as i32,
            soa.minimum,
        );
        let mut record = Record::from_rdata(fqdn(zone)?, soa.minimum, RData::SOA(rdata));
        record.set_dns_class(DNSClass::IN);
        Ok(record)
    }

    /// Apex NS records: this server unless it is a hidden primary, then every
    /// configured peer name.
    pub fn ns_records(&self, zone: &str) -> Result<Vec<Record>, DnsError> {
        let apex = fqdn(zone)?;
        let zone_config = self.config.zone_config(zone);
        let hidden = zone_config.is_some_and(|z| z.hidden_primary);

        let mut targets = Vec::new();
        if !hidden {
            targets.push(self.config.my_name.clone());
        }
        for peer in zone_config.iter().flat_map(|z| z.ns_peers()) {
            targets.push(peer.to_string());
        }

        targets
            .iter()
            .map(|target| {
                let mut record =
                    Record::from_rdata(apex.clone(), self.config.ns_ttl, RData::NS(NS(fqdn(target)?)));
                record.set_dns_class(DNSClass::IN);
                Ok(record)
            })
            .collect()
    }

    /// Stored records under `leaf` in `zone`.
    pub async fn leaf_records(&self, zone: &str, leaf: &str) -> Result<Vec<ZoneRecord>, DnsError> {
        match self.store.hget(&keys::zone(zone), leaf).await? {
            Some(raw) => decode_list(&raw),
            None => Ok(Vec::new()),
        }
    }

    /// Every stored name of `zone` with its still encoded records, in name
    /// order. Decode each with [`ZoneAuthority::decode_leaf`] as it is used.
    pub async fn stored_names(&self, zone: &str) -> Result<BTreeMap<String, String>, DnsError> {
        self.store.hgetall(&keys::zone(zone)).await
    }

    /// Decode the stored records of `leaf`.
    pub fn decode_leaf(zone: &str, leaf: &str, raw: &str) -> Result<Vec<ZoneRecord>, DnsError> {
        decode_list(raw).map_err(|e| {
            warn!(zone, leaf, error = %e, "corrupt stored records");
            e
        })
    }

    /// Wire records for stored records under `leaf` in `zone`.
    pub fn wire_records<'a>(
        &self,
        leaf: &str,
        zone: &str,
        records: impl IntoIterator<Item = &'a ZoneRecord>,
    ) -> Result<Vec<Record>, DnsError> {
        let owner = Self::owner_name(leaf, zone)?;
        records
            .into_iter()
            .map(|r| r.to_record(&owner, self.config.ttl))
            .collect()
    }
}
