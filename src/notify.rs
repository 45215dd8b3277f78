//! Peer health and NOTIFY sweeps.
//!
//! Peers that keep failing NOTIFY are blacklisted for a cooldown so one dead
//! secondary does not slow every sweep down. A successful NOTIFY or transfer
//! probe clears the failure count.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::authority::ZoneAuthority;
use crate::error::DnsError;
use crate::metrics::{self, NotifyResult};
use crate::peer_client::PeerClient;
use crate::peers::PeerBook;
use crate::store;

/// Consecutive failures before a peer is blacklisted.
pub const MAX_FAILURES: u32 = 5;

#[derive(Debug, Default)]
struct PeerState {
    failures: u32,
    blacklisted_until: Option<Instant>,
}

/// In-memory failure counters and blacklist.
#[derive(Debug)]
pub struct PeerHealth {
    peers: Mutex<HashMap<String, PeerState>>,
    cooldown: Duration,
}

impl PeerHealth {
    /// Blacklist peers for `cooldown` after [`MAX_FAILURES`] failures.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            cooldown,
        }
    }

    /// Whether `peer` is currently blacklisted. An expired blacklist entry is
    /// cleared along with the failure count.
    pub fn is_blacklisted(&self, peer: &str) -> bool {
        let mut peers = self.peers.lock();
        let Some(state) = peers.get_mut(peer) else {
            return false;
        };
        match state.blacklisted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                debug!(peer, "blacklist expired");
                *state = PeerState::default();
                false
            }
            None => false,
        }
    }

    /// Count a failure. Returns true when this failure blacklisted the peer.
    pub fn record_failure(&self, peer: &str) -> bool {
        let mut peers = self.peers.lock();
        let state = peers.entry(peer.to_string()).or_default();
        state.failures += 1;
        if state.failures >= MAX_FAILURES && state.blacklisted_until.is_none() {
            state.blacklisted_until = Some(Instant::now() + self.cooldown);
            warn!(peer, failures = state.failures, cooldown = ?self.cooldown, "blacklisting peer");
            return true;
        }
        false
    }

    /// Clear failures after a successful exchange.
    pub fn record_success(&self, peer: &str) {
        self.peers.lock().remove(peer);
    }

    /// Consecutive failures of `peer`.
    pub fn failures(&self, peer: &str) -> u32 {
        self.peers.lock().get(peer).map_or(0, |s| s.failures)
    }
}

/// Sends NOTIFY to every tracked peer that is behind on some zone.
pub struct NotifySweeper {
    authority: Arc<ZoneAuthority>,
    book: PeerBook,
    health: Arc<PeerHealth>,
    client: Arc<dyn PeerClient>,
}

impl NotifySweeper {
    /// Create a sweeper.
    pub fn new(
        authority: Arc<ZoneAuthority>,
        book: PeerBook,
        health: Arc<PeerHealth>,
        client: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            authority,
            book,
            health,
            client,
        }
    }

    /// One sweep over every zone. Returns how many NOTIFYs were answered.
    pub async fn sweep(&self) -> Result<usize, DnsError> {
        let zones = self.authority.index().all_zones().await?;
        let peers = self.book.all_serials().await?;
        let mut sent = 0;

        for zone in zones {
            let Some(latest) = store::latest_serial(self.authority.store().as_ref(), &zone).await? else {
                continue;
            };

            for (peer, serials) in &peers {
                let Some(&known) = serials.get(&zone) else {
                    continue;
                };
                if known >= latest {
                    continue;
                }
                if self.health.is_blacklisted(peer) {
                    debug!(peer = %peer, zone = %zone, "skipping blacklisted peer");
                    metrics::record_notify(NotifyResult::Skipped);
                    continue;
                }
                let Ok(ip) = peer.parse::<IpAddr>() else {
                    warn!(peer = %peer, "tracked peer is not an address");
                    continue;
                };

                let soa = self.authority.soa_record(&zone, latest)?;
                match self.client.notify(ip, &soa).await {
                    Ok(()) => {
                        debug!(peer = %peer, zone = %zone, known, latest, "peer notified");
                        self.health.record_success(peer);
                        metrics::record_notify(NotifyResult::Sent);
                        sent += 1;
                    }
                    Err(e) => {
                        metrics::record_notify(NotifyResult::Failed);
                        let blacklisted = self.health.record_failure(peer);
                        if blacklisted {
                            info!(peer = %peer, error = %e, "peer blacklisted after repeated NOTIFY failures");
                        } else {
                            debug!(peer = %peer, zone = %zone, error = %e, "NOTIFY failed");
                        }
                    }
                }
            }
        }

        Ok(sent)
    }
}
