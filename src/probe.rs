//! Post-transfer probes: after a peer pulls a zone, ask it which serial it
//! ended up with and which software it runs.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DnsError;
use crate::metrics::{self, ProbeKind};
use crate::notify::PeerHealth;
use crate::peer_client::PeerClient;
use crate::peers::PeerBook;

/// Further SOA queries after the first one fails.
pub const SOA_RETRIES: u32 = 2;

/// Wait before the first SOA retry, doubled before each later one.
const SOA_RETRY_DELAY_SECS: u64 = 1;

/// Spawns fire-and-forget probes of peers that completed a transfer.
#[derive(Clone)]
pub struct ProbeScheduler {
    client: Arc<dyn PeerClient>,
    book: PeerBook,
    health: Arc<PeerHealth>,
    delay: Duration,
}

impl ProbeScheduler {
    /// Probe `delay` after each transfer.
    pub fn new(
        client: Arc<dyn PeerClient>,
        book: PeerBook,
        health: Arc<PeerHealth>,
        delay: Duration,
    ) -> Self {
        Self {
            client,
            book,
            health,
            delay,
        }
    }

    /// Probe `peer` about `zone` in the background.
    pub fn schedule(&self, peer: IpAddr, zone: String) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.probe(peer, &zone).await;
        })
    }

    /// Probe `peer` now.
    pub async fn probe(&self, peer: IpAddr, zone: &str) {
        let addr = peer.to_string();

        match self.soa_serial(peer, zone).await {
            Ok(serial) => {
                metrics::record_probe(ProbeKind::Soa, true);
                self.health.record_success(&addr);
                match self.book.record_serial(&addr, zone, serial).await {
                    Ok(()) => info!(peer = %addr, zone, serial, "peer confirmed serial"),
                    Err(e) => warn!(peer = %addr, zone, error = %e, "failed to record peer serial"),
                }
            }
            Err(e) => {
                metrics::record_probe(ProbeKind::Soa, false);
                warn!(peer = %addr, zone, retries = SOA_RETRIES, error = %e, "peer SOA query failed");
            }
        }

        match self.client.version(peer).await {
            Ok(version) => {
                metrics::record_probe(ProbeKind::Version, true);
                if let Err(e) = self.book.record_version(&addr, &version).await {
                    warn!(peer = %addr, error = %e, "failed to record peer version");
                }
            }
            Err(e) => {
                metrics::record_probe(ProbeKind::Version, false);
                debug!(peer = %addr, error = %e, "version probe failed");
            }
        }
    }

    async fn soa_serial(&self, peer: IpAddr, zone: &str) -> Result<u32, DnsError> {
        let mut backoff_secs = SOA_RETRY_DELAY_SECS;
        let mut attempt = 0;
        loop {
            match self.client.soa_serial(peer, zone).await {
                Ok(serial) => return Ok(serial),
                Err(e) if attempt < SOA_RETRIES => {
                    attempt += 1;
                    debug!(peer = %peer, zone, attempt, backoff_secs, error = %e, "SOA query failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
