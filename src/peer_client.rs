//! Outbound DNS exchanges with secondary servers.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::DnsError;
use crate::query::META_SUFFIX;
use crate::record::fqdn;

/// Operations the server performs against its peers.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// Send a NOTIFY for the zone of `soa`, carrying `soa` as the answer.
    async fn notify(&self, peer: IpAddr, soa: &Record) -> Result<(), DnsError>;

    /// Ask `peer` for its SOA serial of `zone`.
    async fn soa_serial(&self, peer: IpAddr, zone: &str) -> Result<u32, DnsError>;

    /// Ask `peer` which server software it runs.
    async fn version(&self, peer: IpAddr) -> Result<String, DnsError>;
}

/// [`PeerClient`] speaking plain DNS over UDP.
#[derive(Debug, Clone)]
pub struct UdpPeerClient {
    port: u16,
    timeout: Duration,
}

impl UdpPeerClient {
    /// Client talking to port 53 with `timeout` per exchange.
    pub fn new(timeout: Duration) -> Self {
        Self { port: 53, timeout }
    }

    /// Use a different peer port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn exchange(&self, peer: IpAddr, message: Message) -> Result<Message, DnsError> {
        let peer_err = |reason: String| DnsError::Peer {
            peer: peer.to_string(),
            reason,
        };

        let bind: SocketAddr = match peer {
            IpAddr::V4(_) => SocketAddr::from(([0u8; 4], 0)),
            IpAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(bind).await?;
        let bytes = message.to_vec()?;
        socket.send_to(&bytes, (peer, self.port)).await?;
        trace!(peer = %peer, id = message.id(), op = ?message.op_code(), "sent peer request");

        let reply = tokio::time::timeout(self.timeout, async {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from.ip() != peer {
                    continue;
                }
                let reply = Message::from_vec(&buf[..len])?;
                if reply.id() == message.id() {
                    return Ok::<_, DnsError>(reply);
                }
            }
        })
        .await
        .map_err(|_| peer_err(format!("no reply within {:?}", self.timeout)))??;

        if reply.response_code() != ResponseCode::NoError {
            return Err(peer_err(format!("answered {}", reply.response_code())));
        }
        Ok(reply)
    }

    async fn txt_query(&self, peer: IpAddr, name: &str, class: DNSClass) -> Result<String, DnsError> {
        let mut query = Query::query(fqdn(name)?, RecordType::TXT);
        query.set_query_class(class);
        let reply = self.exchange(peer, request(OpCode::Query, query)).await?;
        reply
            .answers()
            .iter()
            .find_map(|r| match r.data() {
                RData::TXT(txt) => Some(
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>(),
                ),
                _ => None,
            })
            .ok_or_else(|| DnsError::Peer {
                peer: peer.to_string(),
                reason: format!("no TXT answer for {}", name),
            })
    }
}

fn request(op_code: OpCode, query: Query) -> Message {
    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(op_code);
    message.add_query(query);
    message
}

/// Prefix bare BIND 9 version numbers so reports are self-describing.
fn describe_bind_version(raw: String) -> String {
    if raw.starts_with("9.") {
        format!("ISC BIND {}", raw)
    } else {
        raw
    }
}

#[async_trait]
impl PeerClient for UdpPeerClient {
    async fn notify(&self, peer: IpAddr, soa: &Record) -> Result<(), DnsError> {
        let zone: Name = soa.name().clone();
        let mut message = request(OpCode::Notify, Query::query(zone, RecordType::SOA));
        message.set_authoritative(true);
        message.add_answer(soa.clone());
        self.exchange(peer, message).await?;
        Ok(())
    }

    async fn soa_serial(&self, peer: IpAddr, zone: &str) -> Result<u32, DnsError> {
        let query = Query::query(fqdn(zone)?, RecordType::SOA);
        let reply = self.exchange(peer, request(OpCode::Query, query)).await?;
        reply
            .answers()
            .iter()
            .find_map(|r| match r.data() {
                RData::SOA(soa) => Some(soa.serial()),
                _ => None,
            })
            .ok_or_else(|| DnsError::Peer {
                peer: peer.to_string(),
                reason: format!("no SOA answer for {}", zone),
            })
    }

    async fn version(&self, peer: IpAddr) -> Result<String, DnsError> {
        if let Ok(version) = self.txt_query(peer, "version.server", DNSClass::CH).await {
            return Ok(version);
        }
        if let Ok(version) = self.txt_query(peer, "version.bind", DNSClass::CH).await {
            return Ok(describe_bind_version(version));
        }
        let meta = format!("version.{}", META_SUFFIX);
        self.txt_query(peer, &meta, DNSClass::IN).await
    }
}
