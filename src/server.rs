//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::authority::ZoneAuthority;
use crate::config::DnsConfig;
use crate::error::DnsError;
use crate::gc::GarbageCollector;
use crate::notify::{NotifySweeper, PeerHealth};
use crate::peer_client::{PeerClient, UdpPeerClient};
use crate::peers::{PeerAcl, PeerBook};
use crate::probe::ProbeScheduler;
use crate::query::QueryEngine;
use crate::store::RecordStore;

/// Idle timeout for TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodically NOTIFY lagging peers and collect old serials.
async fn maintenance_loop(
    authority: Arc<ZoneAuthority>,
    sweeper: NotifySweeper,
    gc: GarbageCollector,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sweeper.sweep().await {
                    Ok(sent) if sent > 0 => debug!(sent, "notify sweep done"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "notify sweep failed"),
                }

                let zones = match authority.index().all_zones().await {
                    Ok(zones) => zones,
                    Err(e) => {
                        warn!(error = %e, "could not list zones for garbage collection");
                        continue;
                    }
                };
                if let Err(e) = gc.collect(&zones).await {
                    warn!(error = %e, "garbage collection failed");
                }
            }
            _ = shutdown.cancelled() => {
                debug!("maintenance loop shutting down");
                return;
            }
        }
    }
}

/// Authoritative DNS server over the record store.
pub struct DnsServer {
    config: Arc<DnsConfig>,
    store: Arc<dyn RecordStore>,
    client: Arc<dyn PeerClient>,
}

impl DnsServer {
    /// Create a server for `config` backed by `store`.
    pub fn new(config: DnsConfig, store: Arc<dyn RecordStore>) -> Self {
        let client = Arc::new(UdpPeerClient::new(config.timers.peer_timeout()));
        Self {
            config: Arc::new(config),
            store,
            client,
        }
    }

    /// Use `client` to talk to peers.
    pub fn with_peer_client(mut self, client: Arc<dyn PeerClient>) -> Self {
        self.client = client;
        self
    }

    /// Server configuration.
    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    /// Bind `listen_addr` and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DnsError> {
        let udp_socket = UdpSocket::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS UDP listening");
        let tcp_listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS TCP listening");

        self.serve(udp_socket, tcp_listener, shutdown).await
    }

    /// Serve on already bound sockets until `shutdown` is cancelled.
    pub async fn serve(
        self,
        udp_socket: UdpSocket,
        tcp_listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), DnsError> {
        info!(
            my_name = %self.config.my_name,
            zones = ?self.config.forward_zones.keys().collect::<Vec<_>>(),
            "Starting cns-dns server"
        );

        let acl = Arc::new(PeerAcl::from_config(&self.config).await);
        let book = PeerBook::new(self.store.clone());
        let health = Arc::new(PeerHealth::new(self.config.timers.blacklist_cooldown()));
        let authority = Arc::new(ZoneAuthority::new(self.config.clone(), self.store.clone()));

        let probes = ProbeScheduler::new(
            self.client.clone(),
            book.clone(),
            health.clone(),
            self.config.timers.probe_delay(),
        );
        let handler = QueryEngine::new(authority.clone(), acl, Some(probes));

        let mut server = ServerFuture::new(handler);
        server.register_socket(udp_socket);
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        let sweeper = NotifySweeper::new(authority.clone(), book.clone(), health, self.client.clone());
        let gc = GarbageCollector::new(self.store.clone(), book);
        let maintenance_handle = tokio::spawn(maintenance_loop(
            authority,
            sweeper,
            gc,
            self.config.timers.notify_interval(),
            shutdown.clone(),
        ));

        info!("DNS server ready to serve queries");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
                shutdown.cancel();
            }
        }

        let _ = maintenance_handle.await;

        info!("DNS server stopped");
        Ok(())
    }
}
