//! End-to-end tests against a real server on loopback sockets.

mod common;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cns_dns::config::ZoneConfig;
use cns_dns::store::MemoryStore;
use cns_dns::DnsServer;

use common::*;

/// A server running on random loopback ports.
struct TestServer {
    udp: SocketAddr,
    tcp: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(store: Arc<MemoryStore>) -> Self {
        let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = udp_socket.local_addr().unwrap();
        let tcp = tcp_listener.local_addr().unwrap();

        let mut config = test_dns_config();
        // keep the ACL free of names that would need resolving
        config.forward_zones = BTreeMap::from([(ZONE.to_string(), ZoneConfig::default())]);

        let shutdown = CancellationToken::new();
        let server = DnsServer::new(config, store);
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            server
                .serve(udp_socket, tcp_listener, token)
                .await
                .expect("server failed");
        });

        Self {
            udp,
            tcp,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}

fn query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    let mut query = Query::query(Name::from_ascii(name).unwrap(), record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

async fn udp_query(server: SocketAddr, name: &str, record_type: RecordType, id: u16) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&query_bytes(name, record_type, id), server)
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no UDP response")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

async fn read_tcp_message(stream: &mut TcpStream) -> Message {
    let len = stream.read_u16().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    Message::from_vec(&buf).unwrap()
}

#[tokio::test]
async fn test_udp_query() {
    let store = Arc::new(MemoryStore::new());
    commit_adds(&store, ZONE, None, 5, vec![("vm1.inst.acct", a("10.1.0.1"))]).await;
    let server = TestServer::start(store).await;

    let msg = udp_query(server.udp, "vm1.inst.acct.foo.", RecordType::A, 0x1234).await;
    assert_eq!(msg.id(), 0x1234);
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(msg.answers().len(), 1);
    assert_eq!(address(&msg.answers()[0]), Some("10.1.0.1".parse().unwrap()));

    let msg = udp_query(server.udp, "foo.", RecordType::SOA, 0x1235).await;
    assert_eq!(soa_serial(&msg.answers()[0]), Some(5));

    server.stop().await;
}

#[tokio::test]
async fn test_tcp_axfr() {
    let store = Arc::new(MemoryStore::new());
    let names: Vec<String> = (0..150).map(|i| format!("vm{}.inst.acct", i)).collect();
    let adds = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), a(&format!("10.3.0.{}", i))))
        .collect();
    commit_adds(&store, ZONE, None, 8, adds).await;
    let server = TestServer::start(store).await;

    let mut stream = TcpStream::connect(server.tcp).await.unwrap();
    let bytes = query_bytes("foo.", RecordType::AXFR, 0x4242);
    stream.write_u16(bytes.len() as u16).await.unwrap();
    stream.write_all(&bytes).await.unwrap();

    let mut records = Vec::new();
    let mut soas = 0;
    while soas < 2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), read_tcp_message(&mut stream))
            .await
            .expect("transfer stalled");
        assert_eq!(msg.id(), 0x4242);
        soas += msg.answers().iter().filter(|r| soa_serial(r).is_some()).count();
        records.extend(msg.answers().iter().cloned());
    }

    // SOA + NS + 150 records + SOA
    assert_eq!(records.len(), 153);
    assert_eq!(soa_serial(&records[0]), Some(8));
    assert_eq!(soa_serial(records.last().unwrap()), Some(8));

    server.stop().await;
}
