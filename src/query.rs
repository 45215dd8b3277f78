//! Query engine: answers standard queries and hands transfers to
//! [`TransferEngine`].
//!
//! ## Resolution
//!
//! ```text
//! abc.inst.def.foo  A
//!   → zone "foo" (longest configured suffix, else discovered *.arpa zone)
//!   → leaf "abc.inst.def" in hash zone:foo
//!   → answers (TTL 30) + apex NS in authority
//! ```
//!
//! Names ending in `_cns_meta` are answered from server state instead.

use async_trait::async_trait;
use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use ipnetwork::IpNetwork;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::authority::ZoneAuthority;
use crate::config::normalize_name;
use crate::error::DnsError;
use crate::metrics::{self, QueryResult, Timer};
use crate::peers::PeerAcl;
use crate::probe::ProbeScheduler;
use crate::record::RecordData;
use crate::transfer::TransferEngine;
use crate::zones::leaf;

/// Suffix of server metadata names.
pub const META_SUFFIX: &str = "_cns_meta";

/// Version string served at `version._cns_meta`.
pub fn server_version() -> String {
    format!("cns-dns {}", env!("CARGO_PKG_VERSION"))
}

/// A fully assembled single-message answer.
#[derive(Debug)]
pub(crate) struct Answer {
    pub(crate) code: ResponseCode,
    pub(crate) answers: Vec<Record>,
    pub(crate) authority: Vec<Record>,
    pub(crate) additionals: Vec<Record>,
}

impl Answer {
    pub(crate) fn code(code: ResponseCode) -> Self {
        Self {
            code,
            answers: Vec::new(),
            authority: Vec::new(),
            additionals: Vec::new(),
        }
    }
}

/// Send `answer` as one authoritative response.
pub(crate) async fn send_answer<R: ResponseHandler>(
    request: &Request,
    response_handle: &mut R,
    answer: &Answer,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(true);
    header.set_response_code(answer.code);

    let response = MessageResponseBuilder::from_message_request(request).build(
        header,
        answer.answers.iter(),
        answer.authority.iter(),
        std::iter::empty(),
        answer.additionals.iter(),
    );

    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!(error = %e, "failed to send response");
            serve_failed(request)
        }
    }
}

/// Response info for a request we could not answer at all.
pub(crate) fn serve_failed(request: &Request) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

fn query_result(answer: &Answer) -> QueryResult {
    match answer.code {
        ResponseCode::NoError if answer.answers.is_empty() => QueryResult::NoData,
        ResponseCode::NoError => QueryResult::Success,
        ResponseCode::NXDomain => QueryResult::NxDomain,
        ResponseCode::Refused => QueryResult::Refused,
        _ => QueryResult::Error,
    }
}

/// Authoritative request handler for every configured and discovered zone.
#[derive(Clone)]
pub struct QueryEngine {
    authority: Arc<ZoneAuthority>,
    acl: Arc<PeerAcl>,
    transfers: TransferEngine,
}

impl QueryEngine {
    /// Create a handler. `probes`, when given, is told about every completed
    /// outbound transfer.
    pub fn new(
        authority: Arc<ZoneAuthority>,
        acl: Arc<PeerAcl>,
        probes: Option<ProbeScheduler>,
    ) -> Self {
        let transfers = TransferEngine::new(authority.clone(), acl.clone(), probes);
        Self {
            authority,
            acl,
            transfers,
        }
    }

    /// Zone authority shared with the transfer engine.
    pub fn authority(&self) -> &Arc<ZoneAuthority> {
        &self.authority
    }

    async fn meta(&self, request: &Request, owner: &Name, name: &str, qtype: RecordType) -> Answer {
        let what = name
            .strip_suffix(META_SUFFIX)
            .map(|rest| rest.trim_end_matches('.'))
            .unwrap_or("");
        let privileged = self.acl.allows(request.src().ip());

        let txt = |text: String| {
            let mut record = Record::from_rdata(owner.clone(), 0, RData::TXT(TXT::new(vec![text])));
            record.set_dns_class(DNSClass::IN);
            record
        };

        match what {
            "version" if !matches!(qtype, RecordType::TXT | RecordType::ANY) => {
                Answer::code(ResponseCode::NoError)
            }
            "version" => Answer {
                answers: vec![txt(server_version())],
                ..Answer::code(ResponseCode::NoError)
            },
            "peers" | "slaves" | "zones" if !privileged => {
                debug!(src = %request.src(), meta = what, "refusing privileged metadata");
                Answer::code(ResponseCode::Refused)
            }
            "peers" | "slaves" => {
                let answers = self
                    .acl
                    .entries()
                    .iter()
                    .filter_map(|network| {
                        let rdata = match network {
                            IpNetwork::V4(net) if qtype != RecordType::AAAA => {
                                RData::A(A::from(net.ip()))
                            }
                            IpNetwork::V6(net) if qtype != RecordType::A => {
                                RData::AAAA(AAAA::from(net.ip()))
                            }
                            _ => return None,
                        };
                        let mut record = Record::from_rdata(owner.clone(), 0, rdata);
                        record.set_dns_class(DNSClass::IN);
                        Some(record)
                    })
                    .collect();
                Answer {
                    answers,
                    ..Answer::code(ResponseCode::NoError)
                }
            }
            "zones" => match self.authority.index().all_zones().await {
                Ok(zones) => Answer {
                    answers: zones.into_iter().map(txt).collect(),
                    ..Answer::code(ResponseCode::NoError)
                },
                Err(e) => {
                    warn!(error = %e, "failed to list zones");
                    Answer::code(ResponseCode::ServFail)
                }
            },
            _ => Answer::code(ResponseCode::NXDomain),
        }
    }

    async fn answer(&self, owner: &Name, name: &str, zone: &str, qtype: RecordType) -> Result<Answer, DnsError> {
        let authority = &self.authority;

        if name == zone && qtype == RecordType::SOA {
            let serial = authority.latest_serial(zone).await?;
            return Ok(Answer {
                answers: vec![authority.soa_record(zone, serial)?],
                authority: authority.ns_records(zone)?,
                ..Answer::code(ResponseCode::NoError)
            });
        }

        if name == zone && qtype == RecordType::NS {
            return Ok(Answer {
                answers: authority.ns_records(zone)?,
                ..Answer::code(ResponseCode::NoError)
            });
        }

        let leaf = leaf(name, zone);
        let records = authority.leaf_records(zone, leaf).await?;
        let matching: Vec<_> = records
            .iter()
            .filter(|r| qtype == RecordType::ANY || r.data.record_type() == qtype)
            .collect();

        if matching.is_empty() {
            let serial = authority.latest_serial(zone).await?;
            let code = if records.is_empty() {
                ResponseCode::NXDomain
            } else {
                ResponseCode::NoError
            };
            trace!(name, zone, ?qtype, ?code, "negative answer");
            return Ok(Answer {
                authority: vec![authority.soa_record(zone, serial)?],
                ..Answer::code(code)
            });
        }

        let mut answers = Vec::with_capacity(matching.len());
        for record in &matching {
            answers.push(record.to_record(owner, authority.config().ttl)?);
        }

        let additionals = if qtype == RecordType::SRV {
            self.srv_glue(matching.iter().map(|r| &r.data)).await
        } else {
            Vec::new()
        };

        Ok(Answer {
            answers,
            authority: authority.ns_records(zone)?,
            additionals,
            ..Answer::code(ResponseCode::NoError)
        })
    }

    /// A/AAAA records for in-zone SRV targets. A target that cannot be looked
    /// up only loses its own glue.
    async fn srv_glue<'a>(&self, data: impl Iterator<Item = &'a RecordData>) -> Vec<Record> {
        let targets: BTreeSet<String> = data
            .filter_map(|d| match d {
                RecordData::SRV { target, .. } => Some(normalize_name(target)),
                _ => None,
            })
            .collect();

        let mut glue = Vec::new();
        for target in targets {
            let Some(zone) = self.authority.index().forward_zone(&target).map(str::to_string) else {
                continue;
            };
            let leaf = leaf(&target, &zone);
            let records = match self.authority.leaf_records(&zone, leaf).await {
                Ok(records) => records,
                Err(e) => {
                    debug!(target = %target, error = %e, "skipping SRV glue");
                    metrics::record_glue_failure();
                    continue;
                }
            };
            let addresses = records
                .iter()
                .filter(|r| matches!(r.data, RecordData::A(_) | RecordData::AAAA(_)));
            match self.authority.wire_records(leaf, &zone, addresses) {
                Ok(records) => glue.extend(records),
                Err(e) => {
                    debug!(target = %target, error = %e, "skipping SRV glue");
                    metrics::record_glue_failure();
                }
            }
        }
        glue
    }
}

#[async_trait]
impl RequestHandler for QueryEngine {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        if request.message_type() != MessageType::Query {
            return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::FormErr)).await;
        }
        if request.op_code() != OpCode::Query {
            debug!(op = ?request.op_code(), src = %request.src(), "unsupported opcode");
            return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::NotImp)).await;
        }
        let Some(query) = request.queries().first() else {
            return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::FormErr)).await;
        };

        let owner = Name::from(query.name().clone());
        let name = normalize_name(&owner.to_ascii());
        let qtype = query.query_type();
        let rtype_str = format!("{:?}", qtype);
        trace!(name = %name, ?qtype, src = %request.src(), "DNS query");

        let is_meta = name == META_SUFFIX || name.ends_with(&format!(".{}", META_SUFFIX));
        if is_meta {
            let answer = self.meta(request, &owner, &name, qtype).await;
            metrics::record_query(&rtype_str, query_result(&answer), timer.elapsed());
            return send_answer(request, &mut response_handle, &answer).await;
        }

        let zone = match self.authority.index().find_zone(&name).await {
            Ok(Some(zone)) => zone,
            Ok(None) => {
                debug!(name = %name, "query outside served zones");
                metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
                return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::ServFail)).await;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "zone lookup failed");
                metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
                return send_answer(request, &mut response_handle, &Answer::code(ResponseCode::ServFail)).await;
            }
        };

        if matches!(qtype, RecordType::AXFR | RecordType::IXFR) {
            return self
                .transfers
                .handle(request, response_handle, &zone, qtype)
                .await;
        }

        let answer = match self.answer(&owner, &name, &zone, qtype).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(name = %name, zone = %zone, error = %e, "lookup failed");
                Answer::code(ResponseCode::ServFail)
            }
        };
        debug!(name = %name, ?qtype, code = ?answer.code, answers = answer.answers.len(), "answered");
        metrics::record_query(&rtype_str, query_result(&answer), timer.elapsed());
        send_answer(request, &mut response_handle, &answer).await
    }
}
