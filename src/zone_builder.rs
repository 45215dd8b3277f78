//! Staged changes to one zone, committed as a single new serial.
//!
//! A [`ZoneBuilder`] collects additions and removals against the stored
//! contents of a zone and, on [`ZoneBuilder::commit`], writes the diff log,
//! the rewritten name entries and the serial history in that order. Readers
//! that look up the diff log before the hash therefore never see a serial
//! whose diff is missing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::DnsError;
use crate::record::{decode_list, encode_list, DiffEntry, ZoneRecord};
use crate::store::{keys, RecordStore};

/// Pending changes to one zone between two serials.
pub struct ZoneBuilder {
    store: Arc<dyn RecordStore>,
    zone: String,
    from_serial: Option<u32>,
    to_serial: u32,
    removes: Vec<DiffEntry>,
    adds: Vec<DiffEntry>,
}

impl std::fmt::Debug for ZoneBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneBuilder")
            .field("zone", &self.zone)
            .field("from_serial", &self.from_serial)
            .field("to_serial", &self.to_serial)
            .field("removes", &self.removes.len())
            .field("adds", &self.adds.len())
            .finish()
    }
}

impl ZoneBuilder {
    /// Start a builder moving `zone` from `from_serial` (None for a zone's
    /// first commit) to `to_serial`.
    pub fn new(
        store: Arc<dyn RecordStore>,
        zone: impl Into<String>,
        from_serial: Option<u32>,
        to_serial: u32,
    ) -> Self {
        Self {
            store,
            zone: zone.into(),
            from_serial,
            to_serial,
            removes: Vec::new(),
            adds: Vec::new(),
        }
    }

    /// Zone this builder changes.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Serial the changes apply on top of.
    pub fn from_serial(&self) -> Option<u32> {
        self.from_serial
    }

    /// Serial the commit will produce.
    pub fn to_serial(&self) -> u32 {
        self.to_serial
    }

    /// Move the target serial. Only valid before commit.
    pub(crate) fn retarget(&mut self, to_serial: u32) {
        self.to_serial = to_serial;
    }

    /// Whether any change is staged.
    pub fn is_dirty(&self) -> bool {
        !self.removes.is_empty() || !self.adds.is_empty()
    }

    /// Staged removals.
    pub fn removals(&self) -> &[DiffEntry] {
        &self.removes
    }

    /// Staged additions.
    pub fn additions(&self) -> &[DiffEntry] {
        &self.adds
    }

    async fn stored(&self, name: &str) -> Result<Vec<ZoneRecord>, DnsError> {
        match self.store.hget(&keys::zone(&self.zone), name).await? {
            Some(raw) => decode_list(&raw),
            None => Ok(Vec::new()),
        }
    }

    fn is_removed(&self, name: &str, record: &ZoneRecord) -> bool {
        match &record.id {
            Some(id) => self
                .removes
                .iter()
                .any(|r| r.name == name && r.record.id.as_ref() == Some(id)),
            None => false,
        }
    }

    /// Records under `name` as they will be after commit.
    pub async fn list(&self, name: &str) -> Result<Vec<ZoneRecord>, DnsError> {
        let mut records: Vec<ZoneRecord> = self
            .stored(name)
            .await?
            .into_iter()
            .filter(|r| !self.is_removed(name, r))
            .collect();
        records.extend(
            self.adds
                .iter()
                .filter(|e| e.name == name)
                .map(|e| e.record.clone()),
        );
        Ok(records)
    }

    /// Stage removal of every stored record under `name`, or only those owned
    /// by `src` when given.
    pub async fn clear(&mut self, name: &str, src: Option<&str>) -> Result<(), DnsError> {
        for record in self.stored(name).await? {
            if src.is_some() && record.src.as_deref() != src {
                continue;
            }
            if record.id.is_none() || self.is_removed(name, &record) {
                continue;
            }
            self.removes.push(DiffEntry {
                name: name.to_string(),
                record,
            });
        }
        Ok(())
    }

    /// Stage removal of the stored record with `id` under `name`.
    pub async fn remove(&mut self, name: &str, id: &str) -> Result<(), DnsError> {
        let record = self
            .stored(name)
            .await?
            .into_iter()
            .find(|r| r.id.as_deref() == Some(id))
            .ok_or_else(|| DnsError::RecordNotFound {
                zone: self.zone.clone(),
                name: name.to_string(),
                id: id.to_string(),
            })?;
        self.remove_record(name, record);
        Ok(())
    }

    /// Stage removal of a record previously returned by [`Self::list`].
    ///
    /// A record staged for addition in this builder is simply unstaged.
    pub fn remove_record(&mut self, name: &str, record: ZoneRecord) {
        if let Some(pos) = self
            .adds
            .iter()
            .position(|e| e.name == name && e.record.id.is_some() && e.record.id == record.id)
        {
            self.adds.remove(pos);
            return;
        }
        if record.id.is_none() || self.is_removed(name, &record) {
            return;
        }
        trace!(zone = %self.zone, name, kind = record.data.kind(), "staging removal");
        self.removes.push(DiffEntry {
            name: name.to_string(),
            record,
        });
    }

    /// Stage an addition, assigning an id when the record has none. Returns
    /// the id.
    pub fn add(&mut self, name: &str, mut record: ZoneRecord) -> String {
        let id = record
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        trace!(zone = %self.zone, name, kind = record.data.kind(), "staging addition");
        self.adds.push(DiffEntry {
            name: name.to_string(),
            record,
        });
        id
    }

    /// Replace everything under `name` with `record`.
    pub async fn set(&mut self, name: &str, record: ZoneRecord) -> Result<String, DnsError> {
        self.clear(name, None).await?;
        let staged: Vec<ZoneRecord> = self
            .adds
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.record.clone())
            .collect();
        for old in staged {
            self.remove_record(name, old);
        }
        Ok(self.add(name, record))
    }

    /// Write the staged changes as serial `to_serial`. Returns the serial.
    ///
    /// Every touched name is read and decoded before anything is written, so
    /// a corrupt entry aborts the commit with the store untouched.
    pub async fn commit(self) -> Result<u32, DnsError> {
        if !self.is_dirty() {
            return Ok(self.to_serial);
        }

        let touched: BTreeSet<&str> = self
            .removes
            .iter()
            .chain(self.adds.iter())
            .map(|e| e.name.as_str())
            .collect();

        let mut rewritten = BTreeMap::new();
        for name in touched {
            let mut records: Vec<ZoneRecord> = self
                .stored(name)
                .await?
                .into_iter()
                .filter(|r| !self.is_removed(name, r))
                .collect();
            records.extend(
                self.adds
                    .iter()
                    .filter(|e| e.name == name)
                    .map(|e| e.record.clone()),
            );
            rewritten.insert(name, encode_list(&records)?);
        }

        let removes = self
            .removes
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let adds = self
            .adds
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(from) = self.from_serial {
            let remove_key = keys::diff_remove(&self.zone, from, self.to_serial);
            for entry in &removes {
                self.store.rpush(&remove_key, entry).await?;
            }
            let add_key = keys::diff_add(&self.zone, from, self.to_serial);
            for entry in &adds {
                self.store.rpush(&add_key, entry).await?;
            }
        }

        let zone_key = keys::zone(&self.zone);
        for (name, value) in &rewritten {
            self.store.hset(&zone_key, name, value).await?;
        }

        let serial = self.to_serial.to_string();
        self.store.rpush(&keys::history(&self.zone), &serial).await?;
        self.store.set(&keys::latest(&self.zone), &serial).await?;

        debug!(
            zone = %self.zone,
            from = ?self.from_serial,
            to = self.to_serial,
            removed = removes.len(),
            added = adds.len(),
            names = rewritten.len(),
            "committed zone serial"
        );
        Ok(self.to_serial)
    }
}
