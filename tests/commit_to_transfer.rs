//! Holder updates committed through `CommitEngine` and read back through
//! queries, AXFR and IXFR.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Record, RecordType};

use cns_dns::commit::{CommitEngine, OpenOptions};
use cns_dns::holder::{Holder, Naming};
use cns_dns::record::{decode_list, DiffEntry, ZoneRecord};
use cns_dns::store::{MemoryStore, RecordStore};

use common::*;

const INSTANCE: &str = "abc123.inst.def432.foo.";

fn holder(uuid: &str, ip: &str) -> Holder {
    serde_json::from_value(serde_json::json!({
        "uuid": uuid,
        "owner": { "uuid": "def432" },
        "nics": [{ "ip": ip, "zones": [ZONE] }],
    }))
    .unwrap()
}

fn untimed(serial: u32) -> OpenOptions {
    OpenOptions {
        serial: Some(serial),
        timed: false,
    }
}

async fn commit(engine: &mut CommitEngine, serial: u32, holders: &[Holder]) {
    engine.open_serial(untimed(serial));
    for holder in holders {
        engine.write(holder).await.unwrap();
    }
    assert_eq!(engine.close_serial().await.unwrap(), Some(serial));
}

/// Stored names of `zone` with their records, leaving out emptied names.
async fn snapshot(store: &MemoryStore, zone: &str) -> BTreeMap<String, Vec<ZoneRecord>> {
    store
        .hgetall(&format!("zone:{}", zone))
        .await
        .unwrap()
        .into_iter()
        .map(|(name, raw)| (name, decode_list(&raw).unwrap()))
        .filter(|(_, records)| !records.is_empty())
        .collect()
}

async fn diff(store: &MemoryStore, key: &str) -> Vec<DiffEntry> {
    store
        .lrange(key)
        .await
        .unwrap()
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap())
        .collect()
}

/// Owner, type and rdata of a wire record.
type Rr = (String, RecordType, String);

fn rr(record: &Record) -> Rr {
    (
        record.name().to_string(),
        record.record_type(),
        record.data().to_string(),
    )
}

/// Stored records of an AXFR answer, without the apex SOA and NS.
fn zone_content(records: &[Record]) -> BTreeSet<Rr> {
    records
        .iter()
        .filter(|r| !matches!(r.record_type(), RecordType::SOA | RecordType::NS))
        .map(rr)
        .collect()
}

/// Apply a condensed IXFR answer to `base`.
fn apply_ixfr(mut base: BTreeSet<Rr>, records: &[Record]) -> BTreeSet<Rr> {
    let mut adding = true;
    for record in &records[1..records.len() - 1] {
        if record.record_type() == RecordType::SOA {
            adding = !adding;
            continue;
        }
        if adding {
            base.insert(rr(record));
        } else {
            assert!(base.remove(&rr(record)), "removed record {:?} was not present", record);
        }
    }
    base
}

async fn axfr(engine: &cns_dns::QueryEngine, id: u16) -> Vec<Record> {
    let request = build_request("foo.", RecordType::AXFR, loopback_src(), id);
    all_answers(&execute_request(engine, &request).await)
}

fn new_commit_engine(store: &Arc<MemoryStore>) -> CommitEngine {
    CommitEngine::new(store.clone(), Naming::default(), Duration::from_secs(10))
}

#[tokio::test]
async fn test_committed_holder_is_served() {
    let store = Arc::new(MemoryStore::new());
    let mut commits = new_commit_engine(&store);
    commit(&mut commits, 200, &[holder("abc123", "10.0.0.5")]).await;

    let engine = build_engine(store.clone());
    let msg = execute_query(&engine, INSTANCE, RecordType::A, outside_src(), 1).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(msg.answers().len(), 1);
    assert_eq!(address(&msg.answers()[0]), Some("10.0.0.5".parse::<IpAddr>().unwrap()));

    let msg = execute_query(&engine, INSTANCE, RecordType::TXT, outside_src(), 2).await;
    assert_eq!(txt_text(&msg.answers()[0]).as_deref(), Some("abc123"));

    let msg = execute_query(&engine, "foo.", RecordType::SOA, outside_src(), 3).await;
    assert_eq!(soa_serial(&msg.answers()[0]), Some(200));
}

#[tokio::test]
async fn test_delisted_holder_leaves_every_view() {
    let store = Arc::new(MemoryStore::new());
    let mut commits = new_commit_engine(&store);
    commit(&mut commits, 200, &[holder("abc123", "10.0.0.5")]).await;
    commit(&mut commits, 201, &[holder("ghi789", "10.0.0.6")]).await;

    let mut gone = holder("abc123", "10.0.0.5");
    gone.list_instance = false;
    commit(&mut commits, 202, &[gone]).await;

    let engine = build_engine(store.clone());
    let msg = execute_query(&engine, INSTANCE, RecordType::A, outside_src(), 1).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
    assert_eq!(soa_serial(&msg.name_servers()[0]), Some(202));

    // SOA, NS, the other holder's A and TXT, SOA
    let records = axfr(&engine, 2).await;
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.name().to_string() != INSTANCE));
    let addresses: Vec<IpAddr> = records.iter().filter_map(address).collect();
    assert_eq!(addresses, vec!["10.0.0.6".parse::<IpAddr>().unwrap()]);

    let request = build_ixfr_request("foo.", 200, peer_src(), 3);
    let records = all_answers(&execute_request(&engine, &request).await);
    let serials: Vec<u32> = records.iter().filter_map(soa_serial).collect();
    assert_eq!(serials, vec![202, 200, 201, 201, 202, 202]);

    // the 201 → 202 step removes the instance and adds nothing
    let removed: Vec<&Record> = records[6..records.len() - 2].iter().collect();
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|r| r.name().to_string() == INSTANCE));
    assert_eq!(address(removed[0]), Some("10.0.0.5".parse::<IpAddr>().unwrap()));
}

#[tokio::test]
async fn test_stored_diffs_replay_between_snapshots() {
    let store = Arc::new(MemoryStore::new());
    let mut commits = new_commit_engine(&store);

    let mut snapshots = Vec::new();
    commit(&mut commits, 200, &[holder("abc123", "10.0.0.5")]).await;
    snapshots.push(snapshot(&store, ZONE).await);
    commit(&mut commits, 201, &[holder("abc123", "10.0.0.7"), holder("ghi789", "10.0.0.6")]).await;
    snapshots.push(snapshot(&store, ZONE).await);
    let mut gone = holder("abc123", "10.0.0.7");
    gone.list_instance = false;
    commit(&mut commits, 202, &[gone]).await;
    snapshots.push(snapshot(&store, ZONE).await);

    for (step, (from, to)) in [(200, 201), (201, 202)].into_iter().enumerate() {
        let mut replayed = snapshots[step].clone();
        for entry in diff(&store, &format!("zone:foo:{}:{}:remove", from, to)).await {
            let records = replayed.get_mut(&entry.name).unwrap();
            records.retain(|r| !r.matches(&entry.record));
        }
        for entry in diff(&store, &format!("zone:foo:{}:{}:add", from, to)).await {
            replayed.entry(entry.name).or_default().push(entry.record);
        }
        replayed.retain(|_, records| !records.is_empty());
        assert_eq!(replayed, snapshots[step + 1], "diff {} → {} does not replay", from, to);
    }
}

#[tokio::test]
async fn test_ixfr_converges_on_axfr() {
    let store = Arc::new(MemoryStore::new());
    let mut commits = new_commit_engine(&store);
    let engine = build_engine(store.clone());

    commit(&mut commits, 200, &[holder("abc123", "10.0.0.5")]).await;
    let first = zone_content(&axfr(&engine, 1).await);
    commit(&mut commits, 201, &[holder("ghi789", "10.0.0.6")]).await;
    commit(&mut commits, 202, &[holder("abc123", "10.0.0.8")]).await;
    let mut gone = holder("ghi789", "10.0.0.6");
    gone.list_instance = false;
    commit(&mut commits, 203, &[gone]).await;

    let last = zone_content(&axfr(&engine, 2).await);
    assert_ne!(first, last);

    let request = build_ixfr_request("foo.", 200, peer_src(), 3);
    let records = all_answers(&execute_request(&engine, &request).await);
    let serials: Vec<u32> = records.iter().filter_map(soa_serial).collect();
    assert_eq!(serials, vec![203, 200, 201, 201, 202, 202, 203, 203]);
    assert_eq!(apply_ixfr(first, &records), last);
}
