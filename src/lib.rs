//! CNS DNS - An authoritative DNS server for a fleet of virtual machines.
//!
//! Holder updates (one JSON document per VM) are turned into zone records,
//! batched under a serial and committed to a key/value record store together
//! with per-serial diffs. The server answers queries from the store, serves
//! AXFR/IXFR to its secondaries and keeps them current with NOTIFY.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            cns-dns                               │
//! │                                                                  │
//! │  holder updates                                                  │
//! │       │                                                          │
//! │       ▼                                                          │
//! │  ┌──────────────┐   ┌──────────────┐                             │
//! │  │ CommitEngine │──▶│ ZoneBuilder  │──┐                          │
//! │  │ (one serial) │   │ (per zone)   │  │                          │
//! │  └──────────────┘   └──────────────┘  ▼                          │
//! │                                 ┌──────────────┐                 │
//! │                                 │ RecordStore  │  zone:<z>       │
//! │                                 │ (redis/mem)  │  zone:<z>:all   │
//! │                                 └──────┬───────┘  diffs, peers   │
//! │                                        │                         │
//! │  ┌─────────────┐   ┌───────────────┐   │   ┌──────────────────┐  │
//! │  │ QueryEngine │──▶│ ZoneAuthority │◀──┴──▶│ NotifySweeper/GC │  │
//! │  │ + Transfer  │   └───────────────┘       └────────┬─────────┘  │
//! │  └──────┬──────┘                                    │            │
//! │         │◀── UDP/TCP :53                  NOTIFY ──▶ peers       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use cns_dns::{store, Config, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cns_dns::DnsError> {
//!     let config = Config::load("cns-dns.toml".as_ref())?;
//!     let store = store::connect(&config.store).await?;
//!
//!     let shutdown = CancellationToken::new();
//!     DnsServer::new(config.dns, store).run(shutdown).await
//! }
//! ```

#![warn(missing_docs)]

pub mod authority;
pub mod commit;
pub mod config;
pub mod error;
pub mod gc;
pub mod holder;
pub mod metrics;
pub mod notify;
pub mod peer_client;
pub mod peers;
pub mod probe;
pub mod query;
pub mod record;
pub mod redis_store;
pub mod serial;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod transfer;
pub mod zone_builder;
pub mod zones;

// Re-export main types
pub use commit::{CommitEngine, CommitHandle, OpenOptions};
pub use config::{Config, DnsConfig, SoaConfig, StoreConfig, TelemetryConfig, ZoneConfig};
pub use error::DnsError;
pub use holder::Holder;
pub use query::QueryEngine;
pub use record::{RecordData, ZoneRecord};
pub use server::DnsServer;
pub use store::{MemoryStore, RecordStore};
pub use zone_builder::ZoneBuilder;
