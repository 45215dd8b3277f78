//! Metrics instrumentation for cns-dns.
//!
//! All metrics are prefixed with `cns_dns.`

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::NoData => "nodata",
        QueryResult::Refused => "refused",
        QueryResult::Error => "error",
    };

    counter!("cns_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("cns_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Query returned records.
    Success,
    /// Name holds no records.
    NxDomain,
    /// Name exists but holds nothing of the asked type.
    NoData,
    /// Requester is not allowed to ask.
    Refused,
    /// Query failed with an error.
    Error,
}

/// Record an SRV target whose glue could not be looked up.
pub fn record_glue_failure() {
    counter!("cns_dns.query.glue_failure.count").increment(1);
}

/// Record an outbound zone transfer.
pub fn record_transfer(kind: TransferKind, records: usize) {
    let kind_str = match kind {
        TransferKind::Axfr => "axfr",
        TransferKind::Ixfr => "ixfr",
        TransferKind::IxfrCurrent => "ixfr_current",
        TransferKind::IxfrFallback => "ixfr_fallback",
    };

    counter!("cns_dns.transfer.count", "kind" => kind_str).increment(1);
    histogram!("cns_dns.transfer.records", "kind" => kind_str).record(records as f64);
}

/// Shape of a served transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Full zone.
    Axfr,
    /// Incremental diffs.
    Ixfr,
    /// Requester already had the latest serial.
    IxfrCurrent,
    /// Requested base serial was unknown; full zone sent instead.
    IxfrFallback,
}

/// Record a transfer refused by the ACL.
pub fn record_transfer_denied() {
    counter!("cns_dns.transfer.denied.count").increment(1);
}

/// Record a holder update accepted into the open serial.
pub fn record_holder_update() {
    counter!("cns_dns.commit.holder_update.count").increment(1);
}

/// Record a closed serial.
pub fn record_commit(zones: usize, duration: Duration) {
    counter!("cns_dns.commit.count").increment(1);
    histogram!("cns_dns.commit.zones").record(zones as f64);
    histogram!("cns_dns.commit.duration.seconds").record(duration.as_secs_f64());
}

/// Record a failed zone commit or holder update.
pub fn record_commit_error() {
    counter!("cns_dns.commit.error.count").increment(1);
}

/// Record the latest serial of a zone.
pub fn record_serial(zone: &str, serial: u32) {
    gauge!("cns_dns.zone.serial", "zone" => zone.to_string()).set(serial as f64);
}

/// Record a NOTIFY attempt.
pub fn record_notify(result: NotifyResult) {
    let result_str = match result {
        NotifyResult::Sent => "sent",
        NotifyResult::Failed => "failed",
        NotifyResult::Skipped => "skipped",
    };

    counter!("cns_dns.notify.count", "result" => result_str).increment(1);
}

/// NOTIFY outcomes.
#[derive(Debug, Clone, Copy)]
pub enum NotifyResult {
    /// Peer acknowledged.
    Sent,
    /// Timed out or answered with an error.
    Failed,
    /// Peer is blacklisted.
    Skipped,
}

/// Record a peer probe.
pub fn record_probe(kind: ProbeKind, ok: bool) {
    let kind_str = match kind {
        ProbeKind::Soa => "soa",
        ProbeKind::Version => "version",
    };

    counter!("cns_dns.probe.count", "kind" => kind_str, "ok" => ok.to_string()).increment(1);
}

/// What a probe asked.
#[derive(Debug, Clone, Copy)]
pub enum ProbeKind {
    /// SOA serial.
    Soa,
    /// Server software version.
    Version,
}

/// Record serials removed by garbage collection.
pub fn record_gc(zone: &str, removed: usize) {
    counter!("cns_dns.gc.removed.count", "zone" => zone.to_string()).increment(removed as u64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
