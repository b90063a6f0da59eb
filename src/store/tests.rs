/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use super::*;
use crate::core::clock::ManualClock;
use crate::store::decode::ipv4_udp_packet;
use crate::store::expiry::MappingKey;
use crate::store::latency::tests::RecordingSink;
use hickory_proto::op::{MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;

struct TempDir(PathBuf);

impl TempDir {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "domain-store-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        Self(dir)
    }

    fn file(&self) -> PathBuf {
        self.0.join("nested").join("dnsinfo.txt")
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn name(value: &str) -> Name {
    Name::from_ascii(value).unwrap()
}

fn a_record(owner: &str, ip: &str) -> Record {
    let ip: Ipv4Addr = ip.parse().unwrap();
    Record::from_rdata(name(owner), 60, RData::A(A(ip)))
}

fn aaaa_record(owner: &str, ip: &str) -> Record {
    let ip: Ipv6Addr = ip.parse().unwrap();
    Record::from_rdata(name(owner), 60, RData::AAAA(AAAA(ip)))
}

fn cname_record(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), 60, RData::CNAME(CNAME(name(target))))
}

fn response(answers: Vec<Record>, additionals: Vec<Record>) -> Message {
    let question = answers
        .first()
        .or_else(|| additionals.first())
        .map(|r| r.name().clone())
        .unwrap_or_else(|| name("example.com"));
    let mut message = Message::new();
    message
        .set_id(42)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .add_query(Query::query(question, RecordType::A));
    for record in answers {
        message.add_answer(record);
    }
    for record in additionals {
        message.add_additional(record);
    }
    message
}

fn client_ip() -> IpAddr {
    "10.0.0.10".parse().unwrap()
}

fn client() -> ClientKey {
    ClientKey::Ip(client_ip())
}

struct MockHandler {
    changed: Mutex<Vec<String>>,
    sync_needed: AtomicBool,
}

impl Default for MockHandler {
    fn default() -> Self {
        Self {
            changed: Mutex::new(Vec::new()),
            sync_needed: AtomicBool::new(true),
        }
    }
}

impl DomainChangeHandler for MockHandler {
    fn on_domain_change(&self, name: &str) -> bool {
        self.changed.lock().push(name.to_string());
        self.sync_needed.load(Ordering::SeqCst)
    }
}

/// Drives the store the way the dataplane would, without the main loop.
struct Harness {
    store: DomainInfoStore,
    handler: Arc<MockHandler>,
    ready: mpsc::Receiver<()>,
    released: Arc<Mutex<Vec<String>>>,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    fn with_config(config: StoreConfig) -> Self {
        let clock = ManualClock::new(Utc::now());
        let store = DomainInfoStore::with_clock(&config, None, Arc::new(clock.clone())).unwrap();
        let handler = Arc::new(MockHandler::default());
        store.register_handler(handler.clone());
        let ready = store.updates_ready().unwrap();
        Self {
            store,
            handler,
            ready,
            released: Arc::new(Mutex::new(Vec::new())),
            clock,
        }
    }

    fn program(&self, client: &ClientKey, record: Record, callback_id: Option<&str>) -> u64 {
        self.program_message(client, &response(vec![record], vec![]), callback_id)
    }

    fn program_message(&self, client: &ClientKey, message: &Message, callback_id: Option<&str>) -> u64 {
        let callback = callback_id.map(|id| {
            let released = self.released.clone();
            let id = id.to_string();
            Box::new(move || released.lock().push(id)) as ReleaseCallback
        });
        self.store
            .shared
            .process_dns_response(client, message, callback)
    }

    fn handle_updates_and_expect_changes_for(&mut self, domains: &[&str]) {
        assert_eq!(self.ready.try_recv(), Ok(()), "expected an updates ready signal");
        assert_eq!(self.ready.try_recv(), Err(TryRecvError::Empty));

        self.store.handle_updates();
        let changed = std::mem::take(&mut *self.handler.changed.lock());
        for domain in domains {
            assert!(
                changed.iter().any(|c| c == domain),
                "expected {domain} to be signalled, got {changed:?}"
            );
        }
    }

    fn expect_callbacks(&self, expected: &[&str]) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.released.lock().len() < expected.len() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Give stragglers a chance to show up.
        std::thread::sleep(Duration::from_millis(20));

        let mut released = std::mem::take(&mut *self.released.lock());
        released.sort();
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(released, expected);
    }
}

#[test]
fn test_a_and_aaaa_answers_and_additionals() {
    let mut h = Harness::new();
    let message = response(
        vec![a_record("a.com.", "10.1.1.1"), a_record("A.com.", "10.1.1.2")],
        vec![aaaa_record("b.com.", "fd5f:65af::1")],
    );
    h.program_message(&client(), &message, None);
    h.handle_updates_and_expect_changes_for(&["a.com", "b.com"]);

    let mut ips = h.store.get_domain_ips("a.com");
    ips.sort();
    assert_eq!(ips, vec!["10.1.1.1".to_string(), "10.1.1.2".to_string()]);
    assert_eq!(h.store.get_domain_ips("b.com"), vec!["fd5f:65af::1".to_string()]);
}

#[test]
fn test_unsupported_records_ignored() {
    let h = Harness::new();
    let mut record = a_record("a.com.", "10.1.1.1");
    record.set_dns_class(hickory_proto::rr::DNSClass::CH);
    let revision = h.program(&client(), record, None);
    assert_eq!(revision, 0);
    assert!(h.store.get_domain_ips("a.com").is_empty());
    assert!(!h.store.shared.has_pending_changes());
}

#[test]
fn test_cname_chain_and_reverse_lookup() {
    let mut h = Harness::new();
    h.program(&client(), cname_record("cname1.com.", "cname_2.com."), None);
    h.program(&client(), cname_record("cname_2.com.", "a.com."), None);
    h.program(&client(), a_record("a.com.", "1.2.3.4"), None);
    h.handle_updates_and_expect_changes_for(&["cname1.com", "cname_2.com", "a.com"]);

    assert_eq!(h.store.get_domain_ips("cname1.com"), vec!["1.2.3.4".to_string()]);
    let ip: IpAddr = "1.2.3.4".parse().unwrap();
    assert_eq!(
        &*h.store.get_top_level_domains_for_ip(&client(), ip),
        &["cname1.com".to_string()]
    );
}

#[test]
fn test_updates_with_callbacks() {
    let mut h = Harness::new();

    h.program(&client(), cname_record("a1.com.", "b.com."), Some("cb1"));
    h.handle_updates_and_expect_changes_for(&["a1.com"]);
    h.expect_callbacks(&[]);
    h.store.updates_applied();
    h.expect_callbacks(&["cb1"]);

    h.program(&client(), cname_record("a2.com.", "b.com."), Some("cb2"));
    h.handle_updates_and_expect_changes_for(&["a2.com"]);

    // Still waiting on the dataplane; the last one repeats an earlier answer.
    h.program(&client(), cname_record("b.com.", "c.com."), Some("cb3"));
    h.program(&client(), a_record("c.com.", "3.4.5.6"), Some("cb4"));
    h.program(&client(), cname_record("a2.com.", "b.com."), Some("cb5"));

    h.expect_callbacks(&[]);
    h.store.updates_applied();
    h.expect_callbacks(&["cb2", "cb5"]);

    h.handle_updates_and_expect_changes_for(&["b.com", "c.com"]);
    h.store.updates_applied();
    h.expect_callbacks(&["cb3", "cb4"]);

    assert_eq!(h.store.get_domain_ips("a1.com"), vec!["3.4.5.6".to_string()]);
    assert_eq!(h.store.get_domain_ips("a2.com"), vec!["3.4.5.6".to_string()]);

    // No programming needed: released without waiting for applied.
    h.handler.sync_needed.store(false, Ordering::SeqCst);
    h.program(&client(), a_record("c.com.", "7.8.9.10"), Some("cb6"));
    h.handle_updates_and_expect_changes_for(&["a1.com", "a2.com", "c.com"]);
    h.expect_callbacks(&["cb6"]);
    h.store.updates_applied();
    h.expect_callbacks(&[]);
    h.handler.sync_needed.store(true, Ordering::SeqCst);

    // Already programmed: released at once, nothing signalled.
    h.program(&client(), cname_record("a2.com.", "b.com."), Some("cb7"));
    assert_eq!(h.ready.try_recv(), Err(TryRecvError::Empty));
    h.expect_callbacks(&["cb7"]);
}

#[test]
fn test_branched_graph() {
    let mut h = Harness::new();
    h.program(&client(), cname_record("a1.com.", "b.com."), None);
    h.program(&client(), cname_record("a2.com.", "b.com."), None);
    h.program(&client(), cname_record("b.com.", "c.com."), None);
    h.program(&client(), a_record("c.com.", "3.4.5.6"), None);
    h.handle_updates_and_expect_changes_for(&["a1.com", "a2.com", "b.com", "c.com"]);
    assert_eq!(h.store.get_domain_ips("a1.com"), vec!["3.4.5.6".to_string()]);
    assert_eq!(h.store.get_domain_ips("a2.com"), vec!["3.4.5.6".to_string()]);

    h.program(&client(), a_record("c.com.", "7.8.9.10"), None);
    h.handle_updates_and_expect_changes_for(&["a1.com", "a2.com", "c.com"]);
    let mut ips = h.store.get_domain_ips("a1.com");
    ips.sort();
    assert_eq!(ips, vec!["3.4.5.6".to_string(), "7.8.9.10".to_string()]);

    let key = MappingKey {
        client: client(),
        name: "c.com".to_string(),
        value: "3.4.5.6".to_string(),
    };
    h.clock.advance(chrono::Duration::seconds(120));
    assert!(h.store.shared.state.write().process_mapping_expiry(&key, h.clock.now()));
    h.store.shared.maybe_signal_updates_ready("mapping expired");
    h.handle_updates_and_expect_changes_for(&["a1.com", "a2.com", "c.com"]);
    assert_eq!(h.store.get_domain_ips("a2.com"), vec!["7.8.9.10".to_string()]);

    // c.com still has a value and is the target of b.com.
    assert_eq!(h.store.shared.collect_garbage(), 0);
}

#[test]
fn test_cname_loop_without_addresses() {
    let h = Harness::new();
    h.program(&client(), cname_record("a.com.", "b.com."), None);
    h.program(&client(), cname_record("b.com.", "c.com."), None);
    h.program(&client(), cname_record("c.com.", "a.com."), None);
    assert!(h.store.get_domain_ips("a.com").is_empty());
}

#[test]
fn test_zero_ip_ignored() {
    let h = Harness::new();
    let revision = h.program(&client(), a_record("a.com.", "0.0.0.0"), Some("cb"));
    assert_eq!(revision, 0);
    assert!(h.store.get_domain_ips("a.com").is_empty());
    h.expect_callbacks(&["cb"]);
}

#[test]
fn test_wildcard_watcher_notified_of_new_name() {
    let mut h = Harness::new();
    assert!(h.store.get_domain_ips("*.google.com").is_empty());

    h.program(&client(), a_record("update.google.com.", "1.2.3.5"), None);
    h.handle_updates_and_expect_changes_for(&["*.google.com", "update.google.com"]);
    assert_eq!(h.store.get_domain_ips("*.google.com"), vec!["1.2.3.5".to_string()]);

    let ip: IpAddr = "1.2.3.5".parse().unwrap();
    let mut watched = Vec::new();
    h.store.iter_watched_domains_for_ip(&client(), ip, |domain| {
        watched.push(domain.to_string());
        false
    });
    assert_eq!(watched, vec!["*.google.com".to_string()]);
}

#[test]
fn test_microsoft_style_chain_reaches_wildcard_watcher() {
    let mut h = Harness::new();
    let watched = "*.microsoft.com";
    assert!(h.store.get_domain_ips(watched).is_empty());

    // Each step re-queries like a live watcher would, extending the watch
    // one more hop down the chain.
    let steps = [
        cname_record("www.microsoft.com.", "www.microsoft.com-c-3.edgekey.net."),
        cname_record(
            "www.microsoft.com-c-3.edgekey.net.",
            "www.microsoft.com-c-3.edgekey.net.globalredir.akadns.net.",
        ),
        cname_record(
            "www.microsoft.com-c-3.edgekey.net.globalredir.akadns.net.",
            "e13678.dspb.akamaiedge.net.",
        ),
    ];
    for record in steps {
        h.program(&client(), record, None);
        h.handle_updates_and_expect_changes_for(&[watched]);
        assert!(h.store.get_domain_ips(watched).is_empty());
    }

    h.program(&client(), a_record("e13678.dspb.akamaiedge.net.", "104.75.174.50"), None);
    h.handle_updates_and_expect_changes_for(&[watched]);
    assert_eq!(
        h.store.get_domain_ips(watched),
        vec!["104.75.174.50".to_string()]
    );
}

#[test]
fn test_same_ip_from_different_clients() {
    let h = Harness::new();
    let other = ClientKey::Ip("10.0.0.11".parse().unwrap());
    h.program(&client(), a_record("a.com.", "1.1.1.1"), None);
    h.program(&other, a_record("b.com.", "1.1.1.1"), None);
    h.program(&ClientKey::DefaultGroup, a_record("c.com.", "1.1.1.1"), None);

    let ip: IpAddr = "1.1.1.1".parse().unwrap();
    assert_eq!(&*h.store.get_top_level_domains_for_ip(&client(), ip), &["a.com".to_string()]);
    assert_eq!(&*h.store.get_top_level_domains_for_ip(&other, ip), &["b.com".to_string()]);
    assert_eq!(
        &*h.store.get_top_level_domains_for_ip(&ClientKey::DefaultGroup, ip),
        &["c.com".to_string()]
    );
}

#[test]
fn test_client_attribution_switch() {
    let h = Harness::new();
    assert_eq!(h.store.shared.client_key(client_ip()), client());

    let config = StoreConfig {
        dest_domains_by_client: false,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    assert_eq!(h.store.shared.client_key(client_ip()), ClientKey::DefaultGroup);
}

#[test]
fn test_client_key_persisted_form() {
    assert_eq!(ClientKey::DefaultGroup.to_string(), "0.0.0.0");
    assert_eq!(ClientKey::from_persisted(""), Some(ClientKey::DefaultGroup));
    assert_eq!(ClientKey::from_persisted("0.0.0.0"), Some(ClientKey::DefaultGroup));
    assert_eq!(ClientKey::from_persisted("10.0.0.10"), Some(client()));
    assert_eq!(ClientKey::from_persisted("not-an-ip"), None);
}

#[test]
fn test_extra_ttl_updates() {
    let h = Harness::with_config(StoreConfig {
        extra_ttl: 10,
        ..Default::default()
    });
    h.program(&client(), a_record("a.com.", "1.2.3.4"), None);
    let expiry = h.store.shared.state.read().clients[&client()].mappings["a.com"].values["1.2.3.4"].expiry;
    assert_eq!(expiry - h.clock.now(), chrono::Duration::seconds(70));

    h.store.on_config_update(ConfigUpdate {
        epoch: 0,
        extra_ttl: Duration::from_secs(3600),
    });
    h.program(&client(), a_record("b.com.", "1.2.3.4"), None);
    let expiry = h.store.shared.state.read().clients[&client()].mappings["b.com"].values["1.2.3.4"].expiry;
    assert_eq!(expiry - h.clock.now(), chrono::Duration::seconds(3660));
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn packet_for(message: &Message) -> DnsPacket {
    let server = Ipv4Addr::new(8, 8, 8, 8);
    let client = Ipv4Addr::new(10, 0, 0, 10);
    DnsPacket::new(ipv4_udp_packet(server, client, &message.to_bytes().unwrap()))
}

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        cache_file: dir.file(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_packets_flow_through_main_loop() {
    let dir = TempDir::new("main-loop");
    let sink = Arc::new(RecordingSink::default());
    let store = DomainInfoStore::new(&test_config(&dir), Some(sink.clone())).unwrap();
    let mut ready = store.updates_ready().unwrap();
    store.start().unwrap();
    assert!(store.start().is_err());

    let message = response(
        vec![
            cname_record("a.com.", "b.com."),
            cname_record("b.com.", "c.com."),
            a_record("c.com.", "3.4.5.6"),
        ],
        vec![],
    );
    store.sender().send(DnsPacket::new(vec![1, 2, 3])).await.unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let packet = packet_for(&message)
        .with_timestamp(1_000)
        .with_callback(move || {
            let _ = tx.send(());
        });
    store.sender().send(packet).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), ready.recv())
        .await
        .unwrap();
    assert_eq!(store.get_domain_ips("a.com"), vec!["3.4.5.6".to_string()]);

    // No handlers registered, so nothing needs programming.
    assert!(!store.handle_updates());
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    store.stop().await;
    let counters = store.counters();
    assert_eq!(counters.responses, 1);
    assert_eq!(counters.invalid, 1);

    let saved = std::fs::read_to_string(dir.file()).unwrap();
    assert!(saved.starts_with("2\n"));
    assert!(saved.contains(r#""LHS":"a.com","RHS":"b.com""#));
    assert!(saved.contains(r#""Client":"10.0.0.10""#));
    assert!(!Path::new(&format!("{}.tmp", dir.file().display())).exists());
}

#[tokio::test]
async fn test_restart_restores_saved_mappings() {
    let dir = TempDir::new("restart");
    let config = test_config(&dir);

    let store = DomainInfoStore::new(&config, None).unwrap();
    store.start().unwrap();
    store
        .sender()
        .send(packet_for(&response(vec![a_record("a.com.", "1.2.3.4")], vec![])))
        .await
        .unwrap();
    wait_until(|| !store.get_domain_ips("a.com").is_empty()).await;
    store.stop().await;

    let restarted = DomainInfoStore::new(&config, None).unwrap();
    let mut ready = restarted.updates_ready().unwrap();
    restarted.start().unwrap();
    assert_eq!(ready.try_recv(), Ok(()));
    assert_eq!(restarted.get_domain_ips("a.com"), vec!["1.2.3.4".to_string()]);
    restarted.stop().await;

    // A new epoch makes the saved file stale.
    let bumped = DomainInfoStore::new(
        &StoreConfig {
            epoch: 1,
            ..config.clone()
        },
        None,
    )
    .unwrap();
    bumped.start().unwrap();
    assert!(bumped.get_domain_ips("a.com").is_empty());
    bumped.stop().await;
}

#[tokio::test]
async fn test_epoch_change_clears_cache() {
    let dir = TempDir::new("epoch-change");
    let store = DomainInfoStore::new(&test_config(&dir), None).unwrap();
    let mut ready = store.updates_ready().unwrap();
    store.start().unwrap();

    store
        .sender()
        .send(packet_for(&response(vec![a_record("a.com.", "1.2.3.4")], vec![])))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), ready.recv())
        .await
        .unwrap();
    assert_eq!(store.get_domain_ips("a.com"), vec!["1.2.3.4".to_string()]);
    store.handle_updates();

    store.on_config_update(ConfigUpdate {
        epoch: 1,
        extra_ttl: Duration::ZERO,
    });
    tokio::time::timeout(Duration::from_secs(5), ready.recv())
        .await
        .unwrap();
    wait_until(|| store.get_domain_ips("a.com").is_empty()).await;
    store.stop().await;
}

#[tokio::test]
async fn test_main_loop_expires_mappings() {
    let dir = TempDir::new("expiry");
    let clock = ManualClock::new(Utc::now());
    let store =
        DomainInfoStore::with_clock(&test_config(&dir), None, Arc::new(clock.clone())).unwrap();
    store.start().unwrap();

    store
        .sender()
        .send(packet_for(&response(vec![a_record("a.com.", "1.2.3.4")], vec![])))
        .await
        .unwrap();
    wait_until(|| !store.get_domain_ips("a.com").is_empty()).await;

    clock.advance(chrono::Duration::seconds(61));
    // Any packet wakes the loop so it re-reads the clock.
    store.sender().send(DnsPacket::new(Vec::new())).await.unwrap();
    wait_until(|| store.get_domain_ips("a.com").is_empty()).await;
    store.stop().await;
}
