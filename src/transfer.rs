//! Zone transfers.
//!
//! AXFR streams the whole zone between two copies of its SOA, one stored
//! name at a time, so at most [`CHUNK_RECORDS`] wire records are held before
//! a message goes out. IXFR replays the stored diffs from the requester's
//! serial up to the latest one, in the condensed form of RFC 1995:
//!
//! ```text
//! SOA(latest)
//!   SOA(s0) removals(s0→s1) SOA(s1) additions(s0→s1)
//!   SOA(s1) removals(s1→s2) SOA(s2) additions(s1→s2)
//!   ...
//! SOA(latest)
//! ```

use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, ResponseHandler, ResponseInfo};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::authority::ZoneAuthority;
use crate::error::DnsError;
use crate::metrics::{self, TransferKind};
use crate::peers::{canonical_ip, PeerAcl};
use crate::probe::ProbeScheduler;
use crate::query::{send_answer, serve_failed, Answer};
use crate::record::DiffEntry;
use crate::store::{keys, serial_history};

/// Most records sent in one transfer message.
pub const CHUNK_RECORDS: usize = 100;

/// Adjacent serial pairs to replay for a requester at `base`, or None when
/// `base` is not in the history.
pub fn ixfr_ranges(history: &[u32], base: u32) -> Option<Vec<(u32, u32)>> {
    let start = history.iter().position(|s| *s == base)?;
    Some(
        history[start..]
            .windows(2)
            .map(|pair| (pair[0], pair[1]))
            .collect(),
    )
}

/// Sends transfer records as responses of at most [`CHUNK_RECORDS`] answers.
pub struct ChunkWriter<'a, R> {
    request: &'a Request,
    response_handle: R,
    pending: Vec<Record>,
    records: usize,
    messages: usize,
    last: Option<ResponseInfo>,
}

impl<'a, R: ResponseHandler> ChunkWriter<'a, R> {
    /// Writer answering `request` through `response_handle`.
    pub fn new(request: &'a Request, response_handle: R) -> Self {
        Self {
            request,
            response_handle,
            pending: Vec::with_capacity(CHUNK_RECORDS),
            records: 0,
            messages: 0,
            last: None,
        }
    }

    /// Messages already sent.
    pub fn messages(&self) -> usize {
        self.messages
    }

    /// Give back the response handle, dropping anything still queued.
    pub fn into_handle(self) -> R {
        self.response_handle
    }

    async fn flush(&mut self) -> Result<(), DnsError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut header = Header::response_from_request(self.request.header());
        header.set_authoritative(true);
        header.set_response_code(ResponseCode::NoError);

        let response = MessageResponseBuilder::from_message_request(self.request).build(
            header,
            self.pending.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        let info = self.response_handle.send_response(response).await?;
        trace!(records = self.pending.len(), message = self.messages, "sent transfer chunk");
        self.records += self.pending.len();
        self.messages += 1;
        self.pending.clear();
        self.last = Some(info);
        Ok(())
    }

    /// Queue one record, sending a message once a chunk is full.
    pub async fn push(&mut self, record: Record) -> Result<(), DnsError> {
        self.pending.push(record);
        if self.pending.len() >= CHUNK_RECORDS {
            self.flush().await?;
        }
        Ok(())
    }

    /// Queue every record of `records` in order.
    pub async fn extend(&mut self, records: impl IntoIterator<Item = Record>) -> Result<(), DnsError> {
        for record in records {
            self.push(record).await?;
        }
        Ok(())
    }

    /// Send whatever is still queued. Returns the last response info and
    /// the number of records sent.
    pub async fn finish(mut self) -> Result<(ResponseInfo, usize), DnsError> {
        self.flush().await?;
        let info = self.last.unwrap_or_else(|| serve_failed(self.request));
        Ok((info, self.records))
    }
}

/// Serves AXFR and IXFR to permitted peers.
#[derive(Clone)]
pub struct TransferEngine {
    authority: Arc<ZoneAuthority>,
    acl: Arc<PeerAcl>,
    probes: Option<ProbeScheduler>,
}

impl TransferEngine {
    /// Create a transfer engine.
    pub fn new(
        authority: Arc<ZoneAuthority>,
        acl: Arc<PeerAcl>,
        probes: Option<ProbeScheduler>,
    ) -> Self {
        Self {
            authority,
            acl,
            probes,
        }
    }

    /// Answer an AXFR or IXFR for `zone`.
    pub async fn handle<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        zone: &str,
        qtype: RecordType,
    ) -> ResponseInfo {
        let src = request.src();
        if !self.acl.allows(src.ip()) {
            warn!(src = %src, zone, ?qtype, "refusing zone transfer");
            metrics::record_transfer_denied();
            return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::Refused)).await;
        }

        let base = if qtype == RecordType::IXFR {
            request_serial(request)
        } else {
            None
        };

        let mut writer = ChunkWriter::new(request, response_handle);
        let kind = match self.write_transfer(zone, base, &mut writer).await {
            Ok(kind) => kind,
            Err(e) if writer.messages() == 0 => {
                warn!(zone, error = %e, "failed to build transfer");
                let mut response_handle = writer.into_handle();
                return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::ServFail)).await;
            }
            Err(e) => {
                warn!(src = %src, zone, error = %e, "zone transfer interrupted");
                return serve_failed(request);
            }
        };
        let (info, records) = match writer.finish().await {
            Ok(done) => done,
            Err(e) => {
                warn!(src = %src, zone, error = %e, "zone transfer interrupted");
                return serve_failed(request);
            }
        };
        info!(src = %src, zone, ?kind, records, "sent zone transfer");
        metrics::record_transfer(kind, records);

        let peer = canonical_ip(src.ip());
        if !peer.is_loopback() {
            if let Some(probes) = &self.probes {
                probes.schedule(peer, zone.to_string());
            }
        }
        info
    }

    /// Write the answer to an AXFR (`base` None) or an IXFR from `base`.
    async fn write_transfer<R: ResponseHandler>(
        &self,
        zone: &str,
        base: Option<u32>,
        writer: &mut ChunkWriter<'_, R>,
    ) -> Result<TransferKind, DnsError> {
        let Some(base) = base else {
            self.write_axfr(zone, writer).await?;
            return Ok(TransferKind::Axfr);
        };
        match self.ixfr_records(zone, base).await? {
            Some((kind, records)) => {
                writer.extend(records).await?;
                Ok(kind)
            }
            None => {
                debug!(zone, base, "base serial not in history, sending full zone");
                self.write_axfr(zone, writer).await?;
                Ok(TransferKind::IxfrFallback)
            }
        }
    }

    /// Full zone: SOA, apex NS, every stored record, SOA.
    async fn write_axfr<R: ResponseHandler>(
        &self,
        zone: &str,
        writer: &mut ChunkWriter<'_, R>,
    ) -> Result<(), DnsError> {
        let authority = &self.authority;
        let serial = authority.latest_serial(zone).await?;
        let soa = authority.soa_record(zone, serial)?;

        writer.push(soa.clone()).await?;
        writer.extend(authority.ns_records(zone)?).await?;
        for (leaf, raw) in authority.stored_names(zone).await? {
            let records = ZoneAuthority::decode_leaf(zone, &leaf, &raw)?;
            writer.extend(authority.wire_records(&leaf, zone, &records)?).await?;
        }
        writer.push(soa).await
    }

    /// Incremental transfer from `base`, or None when `base` is no longer in
    /// the history and the full zone has to be sent instead.
    pub async fn ixfr_records(
        &self,
        zone: &str,
        base: u32,
    ) -> Result<Option<(TransferKind, Vec<Record>)>, DnsError> {
        let authority = &self.authority;
        let latest = authority.latest_serial(zone).await?;
        let latest_soa = authority.soa_record(zone, latest)?;

        if base >= latest {
            debug!(zone, base, latest, "requester is up to date");
            return Ok(Some((TransferKind::IxfrCurrent, vec![latest_soa])));
        }

        let history = serial_history(authority.store().as_ref(), zone).await?;
        let Some(ranges) = ixfr_ranges(&history, base) else {
            return Ok(None);
        };

        let mut out = vec![latest_soa.clone()];
        for (from, to) in ranges {
            out.push(authority.soa_record(zone, from)?);
            out.extend(self.diff_records(zone, &keys::diff_remove(zone, from, to)).await?);
            out.push(authority.soa_record(zone, to)?);
            out.extend(self.diff_records(zone, &keys::diff_add(zone, from, to)).await?);
        }
        out.push(latest_soa);
        Ok(Some((TransferKind::Ixfr, out)))
    }

    async fn diff_records(&self, zone: &str, key: &str) -> Result<Vec<Record>, DnsError> {
        let mut out = Vec::new();
        for raw in self.authority.store().lrange(key).await? {
            let entry: DiffEntry = serde_json::from_str(&raw)?;
            out.extend(
                self.authority
                    .wire_records(&entry.name, zone, std::iter::once(&entry.record))?,
            );
        }
        Ok(out)
    }
}

/// Serial from the SOA in the request's authority section.
fn request_serial(request: &Request) -> Option<u32> {
    request.name_servers().iter().find_map(|r| match r.data() {
        RData::SOA(soa) => Some(soa.serial()),
        _ => None,
    })
}
