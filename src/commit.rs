//! Update/commit engine.
//!
//! Holder updates are reconciled into per-zone [`ZoneBuilder`]s that all
//! belong to one open serial. Closing the serial commits every dirty builder
//! and then records what each holder published, so the next update of the
//! same holder can be diffed against it.
//!
//! ```text
//!   CommitHandle ──mpsc──▶ engine task ──▶ CommitEngine
//!                            │  Idle → Open → Committing → Idle
//!                            └─ auto-close deadline
//! ```

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DnsError;
use crate::holder::{build_zones, Holder, Naming, ZoneRecords};
use crate::metrics::{self, Timer};
use crate::record::ZoneRecord;
use crate::serial::next_serial;
use crate::store::{self, keys, RecordStore};
use crate::zone_builder::ZoneBuilder;

/// Default number of queued commands before writers wait.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// How a serial is opened.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Use this serial instead of one derived from the clock.
    pub serial: Option<u32>,
    /// Commit automatically after the configured delay.
    pub timed: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            serial: None,
            timed: true,
        }
    }
}

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// No serial open.
    Idle,
    /// A serial is open and accepting changes.
    Open {
        /// Serial the batch will commit as.
        serial: u32,
    },
    /// The open serial is being written out.
    Committing {
        /// Serial being committed.
        serial: u32,
    },
}

struct HolderBook {
    last_recs: ZoneRecords,
    last_visit: i64,
}

struct PendingBatch {
    serial: u32,
    deadline: Option<Instant>,
    zones: BTreeMap<String, ZoneBuilder>,
    holders: BTreeMap<String, HolderBook>,
}

enum State {
    Idle,
    Open(PendingBatch),
    Committing { serial: u32 },
}

/// Owns the single pending batch and turns holder updates into zone changes.
pub struct CommitEngine {
    store: Arc<dyn RecordStore>,
    naming: Naming,
    close_delay: Duration,
    last_serial: u32,
    state: State,
}

impl CommitEngine {
    /// Create an idle engine.
    pub fn new(store: Arc<dyn RecordStore>, naming: Naming, close_delay: Duration) -> Self {
        Self {
            store,
            naming,
            close_delay,
            last_serial: 0,
            state: State::Idle,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> EnginePhase {
        match &self.state {
            State::Idle => EnginePhase::Idle,
            State::Open(batch) => EnginePhase::Open {
                serial: batch.serial,
            },
            State::Committing { serial } => EnginePhase::Committing { serial: *serial },
        }
    }

    /// When the open serial closes on its own, if it is timed.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Open(batch) => batch.deadline,
            _ => None,
        }
    }

    /// Open a serial unless one is already open. Returns the open serial.
    pub fn open_serial(&mut self, opts: OpenOptions) -> u32 {
        if let State::Open(batch) = &self.state {
            return batch.serial;
        }

        let serial = match opts.serial {
            Some(serial) => serial,
            None => next_serial().max(self.last_serial.wrapping_add(1)),
        };
        let deadline = opts.timed.then(|| Instant::now() + self.close_delay);
        debug!(serial, timed = opts.timed, "opened serial");

        self.state = State::Open(PendingBatch {
            serial,
            deadline,
            zones: BTreeMap::new(),
            holders: BTreeMap::new(),
        });
        serial
    }

    /// Reconcile one holder into the open serial, opening a timed one if
    /// needed.
    pub async fn write(&mut self, holder: &Holder) -> Result<(), DnsError> {
        self.open_serial(OpenOptions::default());
        let State::Open(batch) = &mut self.state else {
            return Err(DnsError::NoOpenSerial);
        };

        let previous = match batch.holders.get(&holder.uuid) {
            Some(book) => book.last_recs.clone(),
            None => load_last_records(self.store.as_ref(), &holder.uuid).await?,
        };

        let last_recs = if holder.list_instance {
            let desired = build_zones(holder, self.naming)?;
            for (zone, names) in &previous {
                for (name, records) in names {
                    let kept = desired.get(zone).is_some_and(|z| z.contains_key(name));
                    if !kept {
                        remove_entries(&self.store, batch, zone, name, records).await?;
                    }
                }
            }
            for (zone, names) in &desired {
                for (name, records) in names {
                    set_entries(&self.store, batch, zone, name, records).await?;
                }
            }
            desired
        } else {
            let desired = build_zones(holder, self.naming).unwrap_or_default();
            for (zone, names) in previous.iter().chain(desired.iter()) {
                for (name, records) in names {
                    remove_entries(&self.store, batch, zone, name, records).await?;
                }
            }
            ZoneRecords::new()
        };

        batch.holders.insert(
            holder.uuid.clone(),
            HolderBook {
                last_recs,
                last_visit: Utc::now().timestamp(),
            },
        );
        metrics::record_holder_update();
        Ok(())
    }

    /// Commit the open serial. Returns the serial, or None when nothing was
    /// open.
    pub async fn close_serial(&mut self) -> Result<Option<u32>, DnsError> {
        let batch = match std::mem::replace(&mut self.state, State::Idle) {
            State::Open(batch) => batch,
            other => {
                self.state = other;
                return Ok(None);
            }
        };

        let serial = batch.serial;
        self.state = State::Committing { serial };
        let timer = Timer::start();
        let result = commit_batch(self.store.as_ref(), batch).await;
        self.state = State::Idle;
        self.last_serial = self.last_serial.max(serial);

        let zones = result?;
        metrics::record_commit(zones, timer.elapsed());
        info!(serial, zones, "closed serial");
        Ok(Some(serial))
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Write(holder) => {
                if let Err(e) = self.write(&holder).await {
                    warn!(holder = %holder.uuid, error = %e, "failed to apply holder update");
                    metrics::record_commit_error();
                }
            }
            Command::Open(opts) => {
                self.open_serial(opts);
            }
            Command::Close(reply) => {
                let result = self.close_serial().await;
                if let Err(e) = &result {
                    error!(error = %e, "failed to close serial");
                }
                let _ = reply.send(result);
            }
        }
    }
}

async fn load_last_records(store: &dyn RecordStore, uuid: &str) -> Result<ZoneRecords, DnsError> {
    match store.hget(&keys::holder(uuid), keys::LAST_RECS).await? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(ZoneRecords::new()),
    }
}

/// Builder for `zone` in the batch, creating it on first use. A zone whose
/// latest serial has already reached the batch serial pushes the whole batch
/// forward so serials stay strictly increasing.
async fn zone_builder<'a>(
    store: &Arc<dyn RecordStore>,
    batch: &'a mut PendingBatch,
    zone: &str,
) -> Result<&'a mut ZoneBuilder, DnsError> {
    if !batch.zones.contains_key(zone) {
        let latest = store::latest_serial(store.as_ref(), zone).await?;
        if let Some(latest) = latest {
            if latest >= batch.serial {
                let bumped = latest.wrapping_add(1);
                warn!(zone, latest, from = batch.serial, to = bumped, "serial would not advance, raising batch serial");
                batch.serial = bumped;
                for builder in batch.zones.values_mut() {
                    builder.retarget(bumped);
                }
            }
        }
        let builder = ZoneBuilder::new(store.clone(), zone, latest, batch.serial);
        batch.zones.insert(zone.to_string(), builder);
    }

    batch
        .zones
        .get_mut(zone)
        .ok_or_else(|| DnsError::Store(format!("builder for {} vanished", zone)))
}

/// Remove records under `name` that match any of `records`.
async fn remove_entries(
    store: &Arc<dyn RecordStore>,
    batch: &mut PendingBatch,
    zone: &str,
    name: &str,
    records: &[ZoneRecord],
) -> Result<(), DnsError> {
    let builder = zone_builder(store, batch, zone).await?;
    let src = records.first().and_then(|r| r.src.clone());
    for current in builder.list(name).await? {
        if src.is_some() && current.src != src {
            continue;
        }
        if records.iter().any(|r| current.matches(r)) {
            builder.remove_record(name, current);
        }
    }
    Ok(())
}

/// Make the records under `name` (restricted to the desired owner, if any)
/// equal to `desired`, touching only what differs.
async fn set_entries(
    store: &Arc<dyn RecordStore>,
    batch: &mut PendingBatch,
    zone: &str,
    name: &str,
    desired: &[ZoneRecord],
) -> Result<(), DnsError> {
    let builder = zone_builder(store, batch, zone).await?;
    let src = desired.first().and_then(|r| r.src.clone());
    let current: Vec<ZoneRecord> = builder
        .list(name)
        .await?
        .into_iter()
        .filter(|r| src.is_none() || r.src == src)
        .collect();

    for record in &current {
        if !desired.iter().any(|d| record.matches(d)) {
            builder.remove_record(name, record.clone());
        }
    }
    for record in desired {
        if !current.iter().any(|c| c.matches(record)) {
            builder.add(name, record.clone());
        }
    }
    Ok(())
}

/// Commit every dirty zone, then the holder bookkeeping. Returns the number
/// of zones written.
async fn commit_batch(store: &dyn RecordStore, batch: PendingBatch) -> Result<usize, DnsError> {
    let mut committed = 0;
    let mut first_error = None;

    for (zone, builder) in batch.zones {
        if !builder.is_dirty() {
            continue;
        }
        match builder.commit().await {
            Ok(serial) => {
                committed += 1;
                metrics::record_serial(&zone, serial);
            }
            Err(e) => {
                error!(zone = %zone, error = %e, "zone commit failed, its changes are discarded");
                metrics::record_commit_error();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    for (uuid, book) in batch.holders {
        let key = keys::holder(&uuid);
        let last_recs = serde_json::to_string(&book.last_recs)?;
        store.hset(&key, keys::LAST_RECS, &last_recs).await?;
        store
            .hset(&key, keys::LAST_VISIT, &book.last_visit.to_string())
            .await?;
    }

    Ok(committed)
}

enum Command {
    Write(Box<Holder>),
    Open(OpenOptions),
    Close(oneshot::Sender<Result<Option<u32>, DnsError>>),
}

/// Cloneable handle feeding the engine task. Commands are applied strictly
/// in the order they are sent.
#[derive(Debug, Clone)]
pub struct CommitHandle {
    tx: mpsc::Sender<Command>,
}

impl CommitHandle {
    /// Queue a holder update. Returns once it is queued; waits while the
    /// queue is full.
    pub async fn write(&self, holder: Holder) -> Result<(), DnsError> {
        self.tx
            .send(Command::Write(Box::new(holder)))
            .await
            .map_err(|_| DnsError::EngineClosed)
    }

    /// Queue opening a serial.
    pub async fn open_serial(&self, opts: OpenOptions) -> Result<(), DnsError> {
        self.tx
            .send(Command::Open(opts))
            .await
            .map_err(|_| DnsError::EngineClosed)
    }

    /// Close the open serial once everything queued before it is applied.
    pub async fn close_serial(&self) -> Result<Option<u32>, DnsError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Close(reply))
            .await
            .map_err(|_| DnsError::EngineClosed)?;
        rx.await.map_err(|_| DnsError::EngineClosed)?
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Write(holder) => write!(f, "Write({})", holder.uuid),
            Command::Open(opts) => write!(f, "Open({:?})", opts),
            Command::Close(_) => write!(f, "Close"),
        }
    }
}

/// Start the engine task. The task commits any open serial and exits when
/// `shutdown` fires or every handle is dropped.
pub fn spawn(
    engine: CommitEngine,
    queue_depth: usize,
    shutdown: CancellationToken,
) -> (CommitHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_depth);
    let task = tokio::spawn(run_engine(engine, rx, shutdown));
    (CommitHandle { tx }, task)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_engine(
    mut engine: CommitEngine,
    mut rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) {
    loop {
        let deadline = engine.deadline();
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("commit engine shutting down");
                break;
            }
            command = rx.recv() => match command {
                Some(command) => engine.handle(command).await,
                None => break,
            },
            _ = wait_until(deadline) => {
                if let Err(e) = engine.close_serial().await {
                    error!(error = %e, "timed serial close failed");
                }
            }
        }
    }

    rx.close();
    while let Some(command) = rx.recv().await {
        engine.handle(command).await;
    }
    if let Err(e) = engine.close_serial().await {
        error!(error = %e, "final serial close failed");
    }
}
