//! Shared test infrastructure for query, transfer and peer tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use cns_dns::authority::ZoneAuthority;
use cns_dns::config::{DnsConfig, SoaConfig, TimerConfig, ZoneConfig};
use cns_dns::peers::PeerAcl;
use cns_dns::probe::ProbeScheduler;
use cns_dns::query::QueryEngine;
use cns_dns::record::{RecordData, ZoneRecord};
use cns_dns::store::{MemoryStore, RecordStore};
use cns_dns::zone_builder::ZoneBuilder;

// --- Constants ---

pub const ZONE: &str = "foo";
pub const HIDDEN_ZONE: &str = "hidden.com";
pub const PEER_IP: &str = "10.0.0.2";

// --- TestResponseHandler ---

/// Captures every serialized DNS response for inspection in tests.
///
/// Transfers send several messages for one request, so each call to
/// `send_response` appends its wire bytes.
#[derive(Clone)]
pub struct TestResponseHandler {
    bufs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            bufs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Parse every captured message.
    pub fn into_messages(self) -> Vec<Message> {
        let bufs = self.bufs.lock().unwrap();
        bufs.iter()
            .map(|buf| Message::from_vec(buf).expect("failed to parse captured DNS response"))
            .collect()
    }

    /// Parse the single captured message.
    pub fn into_message(self) -> Message {
        let mut messages = self.into_messages();
        assert_eq!(messages.len(), 1, "expected exactly one response");
        messages.remove(0)
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.bufs.lock().unwrap().push(buf);
        Ok(info)
    }
}

// --- Addresses ---

/// Loopback source, always in the transfer ACL.
pub fn loopback_src() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

/// Configured transfer peer.
pub fn peer_src() -> SocketAddr {
    SocketAddr::new(PEER_IP.parse().unwrap(), 40000)
}

/// Source outside the transfer ACL.
pub fn outside_src() -> SocketAddr {
    "192.0.2.77:40000".parse().unwrap()
}

// --- Config builders ---

pub fn test_dns_config() -> DnsConfig {
    DnsConfig {
        listen_addr: "127.0.0.1:5353".parse().unwrap(),
        my_name: "ns0.foo".to_string(),
        hostmaster: "hostmaster@foo".to_string(),
        forward_zones: BTreeMap::from([
            (
                ZONE.to_string(),
                ZoneConfig {
                    hidden_primary: false,
                    peers: vec![PEER_IP.to_string()],
                },
            ),
            (
                HIDDEN_ZONE.to_string(),
                ZoneConfig {
                    hidden_primary: true,
                    peers: vec!["ns1.hidden.com".to_string(), "ns2.hidden.com".to_string()],
                },
            ),
        ]),
        reverse_zones: ZoneConfig::default(),
        allow_transfer: vec![],
        use_login: false,
        use_alias: false,
        ttl: 30,
        ns_ttl: 3600,
        soa: SoaConfig::default(),
        timers: TimerConfig::default(),
    }
}

/// ACL with loopback and the configured peer address.
pub fn test_acl() -> Arc<PeerAcl> {
    let mut acl = PeerAcl::new();
    assert!(acl.add(PEER_IP));
    Arc::new(acl)
}

pub fn build_engine(store: Arc<MemoryStore>) -> QueryEngine {
    build_engine_with_probes(store, None)
}

pub fn build_engine_with_probes(store: Arc<MemoryStore>, probes: Option<ProbeScheduler>) -> QueryEngine {
    let authority = Arc::new(ZoneAuthority::new(Arc::new(test_dns_config()), store));
    QueryEngine::new(authority, test_acl(), probes)
}

// --- Store seeding ---

pub fn a(ip: &str) -> ZoneRecord {
    ZoneRecord::new(RecordData::A(ip.parse().unwrap()))
}

pub fn txt(text: &str) -> ZoneRecord {
    ZoneRecord::new(RecordData::TXT(text.to_string()))
}

/// Commit `adds` to `zone` as serial `to`. Returns the assigned ids.
pub async fn commit_adds(
    store: &Arc<MemoryStore>,
    zone: &str,
    from: Option<u32>,
    to: u32,
    adds: Vec<(&str, ZoneRecord)>,
) -> Vec<String> {
    let mut zb = ZoneBuilder::new(store.clone(), zone, from, to);
    let ids = adds
        .into_iter()
        .map(|(name, record)| zb.add(name, record))
        .collect();
    zb.commit().await.expect("commit failed");
    ids
}

/// Commit the removal of record `id` under `name` as serial `to`.
pub async fn commit_remove(store: &Arc<MemoryStore>, zone: &str, from: u32, to: u32, name: &str, id: &str) {
    let mut zb = ZoneBuilder::new(store.clone(), zone, Some(from), to);
    zb.remove(name, id).await.expect("remove failed");
    zb.commit().await.expect("commit failed");
}

/// Zone `foo` at serials 100 → 101 → 102:
/// 100 adds vm1, 101 adds vm2, 102 removes vm1.
pub async fn seed_three_serials(store: &Arc<MemoryStore>) {
    let ids = commit_adds(store, ZONE, None, 100, vec![("vm1.inst.acct", a("10.1.0.1"))]).await;
    commit_adds(store, ZONE, Some(100), 101, vec![("vm2.inst.acct", a("10.1.0.2"))]).await;
    commit_remove(store, ZONE, 101, 102, "vm1.inst.acct", &ids[0]).await;
}

// --- Query/Request construction ---

fn base_message(name: &str, record_type: RecordType, op_code: OpCode, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(op_code);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

fn into_request(msg: Message, src: SocketAddr) -> Request {
    let bytes = msg.to_vec().unwrap();
    Request::new(parse_message_request(&bytes), src, Protocol::Udp)
}

/// Build a standard query with a crafted source address.
pub fn build_request(name: &str, record_type: RecordType, src: SocketAddr, id: u16) -> Request {
    into_request(base_message(name, record_type, OpCode::Query, id), src)
}

/// Build a request with an arbitrary opcode.
pub fn build_op_request(name: &str, op_code: OpCode, src: SocketAddr, id: u16) -> Request {
    into_request(base_message(name, RecordType::SOA, op_code, id), src)
}

/// Build an IXFR request carrying `serial` in the authority section.
pub fn build_ixfr_request(zone: &str, serial: u32, src: SocketAddr, id: u16) -> Request {
    let mut msg = base_message(zone, RecordType::IXFR, OpCode::Query, id);
    let soa = SOA::new(
        Name::from_ascii("ns1.peer.").unwrap(),
        Name::from_ascii("hostmaster.peer.").unwrap(),
        serial,
        60,
        60,
        181440,
        60,
    );
    let mut record = Record::from_rdata(Name::from_ascii(zone).unwrap(), 0, RData::SOA(soa));
    record.set_dns_class(DNSClass::IN);
    msg.add_name_server(record);
    into_request(msg, src)
}

// --- Response helpers ---

/// Execute a query and return the single parsed response.
pub async fn execute_query(
    engine: &QueryEngine,
    name: &str,
    record_type: RecordType,
    src: SocketAddr,
    id: u16,
) -> Message {
    let request = build_request(name, record_type, src, id);
    let handler = TestResponseHandler::new();
    engine.handle_request(&request, handler.clone()).await;
    handler.into_message()
}

/// Execute a prepared request and return every parsed response.
pub async fn execute_request(engine: &QueryEngine, request: &Request) -> Vec<Message> {
    let handler = TestResponseHandler::new();
    engine.handle_request(request, handler.clone()).await;
    handler.into_messages()
}

/// Every answer record across `messages`, in order.
pub fn all_answers(messages: &[Message]) -> Vec<Record> {
    messages
        .iter()
        .flat_map(|m| m.answers().iter().cloned())
        .collect()
}

/// SOA serial of a record, if it is an SOA.
pub fn soa_serial(record: &Record) -> Option<u32> {
    match record.data() {
        RData::SOA(soa) => Some(soa.serial()),
        _ => None,
    }
}

/// Address of an A or AAAA record.
pub fn address(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// Text of a TXT record.
pub fn txt_text(record: &Record) -> Option<String> {
    match record.data() {
        RData::TXT(txt) => Some(
            txt.txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect(),
        ),
        _ => None,
    }
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}
