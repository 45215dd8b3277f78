//! Garbage collection of serials no peer can still ask for.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DnsError;
use crate::metrics;
use crate::peers::PeerBook;
use crate::store::{self, keys, RecordStore};

/// History entries always kept at the tail of a zone's history.
pub const KEEP_LAST: usize = 2;

/// Serials of `history` that may be collected given `watermark`.
pub fn collectable(history: &[u32], watermark: u32) -> Vec<(u32, Option<u32>)> {
    let cutoff = history.len().saturating_sub(KEEP_LAST);
    history[..cutoff]
        .iter()
        .enumerate()
        .filter(|(_, serial)| **serial < watermark)
        .map(|(i, serial)| (*serial, history.get(i + 1).copied()))
        .collect()
}

/// Prunes serial history and diffs below every peer's confirmed serial.
pub struct GarbageCollector {
    store: Arc<dyn RecordStore>,
    book: PeerBook,
}

impl GarbageCollector {
    /// Collector over `store`.
    pub fn new(store: Arc<dyn RecordStore>, book: PeerBook) -> Self {
        Self { store, book }
    }

    /// Collect every zone in `zones`. Returns the number of serials removed.
    pub async fn collect(&self, zones: &[String]) -> Result<usize, DnsError> {
        let peers = self.book.all_serials().await?;
        let mut removed = 0;
        for zone in zones {
            removed += self.collect_zone(zone, &peers).await?;
        }
        Ok(removed)
    }

    /// Collect one zone against the given peer serials.
    pub async fn collect_zone(
        &self,
        zone: &str,
        peers: &BTreeMap<String, BTreeMap<String, u32>>,
    ) -> Result<usize, DnsError> {
        let Some(latest) = store::latest_serial(self.store.as_ref(), zone).await? else {
            return Ok(0);
        };
        let watermark = peers
            .values()
            .filter_map(|serials| serials.get(zone).copied())
            .fold(latest, u32::min);

        let history = store::serial_history(self.store.as_ref(), zone).await?;
        let victims = collectable(&history, watermark);
        if victims.is_empty() {
            return Ok(0);
        }

        let history_key = keys::history(zone);
        for (serial, next) in &victims {
            // Unlink from the history first so a transfer never sees a
            // serial whose diffs are already gone.
            self.store.lrem(&history_key, &serial.to_string()).await?;
            if let Some(next) = next {
                self.store.del(&keys::diff_add(zone, *serial, *next)).await?;
                self.store.del(&keys::diff_remove(zone, *serial, *next)).await?;
            }
            debug!(zone, serial, "collected serial");
        }

        info!(zone, removed = victims.len(), watermark, "garbage collected serial history");
        metrics::record_gc(zone, victims.len());
        Ok(victims.len())
    }
}
