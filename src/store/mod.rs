/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS domain information store.
//!
//! Snoops DNS responses seen on the host and keeps, per client, the
//! `name -> IP` and `name -> CNAME` mappings they carried until their TTL
//! runs out. Policy code asks which IPs a (possibly wildcard) domain maps
//! to; the store tells it when those answers change and holds back each
//! response packet until the dataplane has programmed what it introduced.
//!
//! The flow for one response:
//!
//! 1. a packet arrives on [`DomainInfoStore::sender`] and the main loop
//!    decodes it and stores its records;
//! 2. changed names accumulate and "updates ready" is signalled once;
//! 3. the dataplane calls [`DomainInfoStore::handle_updates`], which runs
//!    every registered [`DomainChangeHandler`];
//! 4. after programming it calls [`DomainInfoStore::updates_applied`] and
//!    the packet's release callback fires.

pub(crate) mod cache;
pub mod decode;
mod event_loop;
pub(crate) mod expiry;
mod gc;
pub mod latency;
pub mod metrics;
mod persist;
pub(crate) mod revision;
pub mod wildcard;

#[cfg(test)]
mod tests;

pub use latency::DnsLogSink;
pub use metrics::{CountersSnapshot, PacketCounters};
pub use revision::ReleaseCallback;

use crate::config::types::{ConfigUpdate, StoreConfig};
use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{Result, StoreError};
use cache::StoreState;
use chrono::{DateTime, Utc};
use event_loop::{LoopParts, MainLoop};
use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RData, Record};
use latency::LatencyCorrelator;
use parking_lot::{Mutex, RwLock};
use revision::{CallbackPlacement, CallbackReleaser};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Persisted form of [`ClientKey::DefaultGroup`].
const DEFAULT_GROUP_IP: &str = "0.0.0.0";

/// Which client's view of DNS a mapping belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientKey {
    /// The client the response was delivered to.
    Ip(IpAddr),
    /// Shared bucket used when responses are not attributed per client.
    DefaultGroup,
}

impl ClientKey {
    pub(crate) fn from_persisted(value: &str) -> Option<Self> {
        match value {
            "" | DEFAULT_GROUP_IP => Some(ClientKey::DefaultGroup),
            other => other.parse().ok().map(ClientKey::Ip),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::Ip(ip) => write!(f, "{ip}"),
            ClientKey::DefaultGroup => f.write_str(DEFAULT_GROUP_IP),
        }
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        ClientKey::Ip(ip)
    }
}

/// Notified, from [`DomainInfoStore::handle_updates`], of each changed domain.
///
/// Returns `true` when the change needs dataplane programming. Implementations
/// may call back into the store; no store lock is held during the call.
pub trait DomainChangeHandler: Send + Sync + 'static {
    fn on_domain_change(&self, name: &str) -> bool;
}

/// One captured packet.
pub struct DnsPacket {
    pub data: Vec<u8>,
    /// Capture time in nanoseconds from an arbitrary base; 0 when unknown.
    pub timestamp: u64,
    pub callback: Option<ReleaseCallback>,
}

impl DnsPacket {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            timestamp: 0,
            callback: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DnsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsPacket")
            .field("len", &self.data.len())
            .field("timestamp", &self.timestamp)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) cache_file: PathBuf,
    pub(crate) save_interval: Duration,
    pub(crate) gc_interval: Duration,
    pub(crate) dest_domains_by_client: bool,
    pub(crate) response_delay: Duration,
}

/// State shared by the handle, the main loop and query handles.
pub(crate) struct Shared {
    pub(crate) state: RwLock<StoreState>,
    pub(crate) settings: Settings,
    pub(crate) counters: PacketCounters,
    ready_tx: mpsc::Sender<()>,
    reset_tx: mpsc::Sender<()>,
    msg_tx: mpsc::Sender<DnsPacket>,
    releaser: CallbackReleaser,
}

#[derive(Default)]
struct Control {
    pending: Option<LoopParts>,
    ready_rx: Option<mpsc::Receiver<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Handle to the store. Cheap to clone; all clones drive the same store.
#[derive(Clone)]
pub struct DomainInfoStore {
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
}

/// Query-only handle that does not keep the store alive.
///
/// Change handlers hold this instead of a [`DomainInfoStore`] so the store
/// and its handlers do not own each other.
#[derive(Clone)]
pub struct DomainLookup {
    shared: Weak<Shared>,
}

impl DomainLookup {
    pub fn get_domain_ips(&self, domain: &str) -> Vec<String> {
        match self.shared.upgrade() {
            Some(shared) => shared.state.write().get_domain_ips(domain),
            None => Vec::new(),
        }
    }
}

impl DomainInfoStore {
    pub fn new(config: &StoreConfig, sink: Option<Arc<dyn DnsLogSink>>) -> Result<Self> {
        Self::with_clock(config, sink, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(
        config: &StoreConfig,
        sink: Option<Arc<dyn DnsLogSink>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (msg_tx, msg_rx) = mpsc::channel(config.channel_capacity);
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let releaser = CallbackReleaser::spawn()
            .map_err(|e| StoreError::runtime(format!("failed to spawn callback thread: {e}")))?;

        let state = StoreState::new(
            clock,
            config.epoch,
            config.extra_ttl(),
            config.max_top_level_domains,
        );
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            settings: Settings {
                cache_file: config.cache_file.clone(),
                save_interval: config.save_interval(),
                gc_interval: config.gc_interval(),
                dest_domains_by_client: config.dest_domains_by_client,
                response_delay: config.response_delay(),
            },
            counters: PacketCounters::default(),
            ready_tx,
            reset_tx,
            msg_tx,
            releaser,
        });

        let control = Control {
            pending: Some(LoopParts {
                msg_rx,
                reset_rx,
                correlator: LatencyCorrelator::new(sink, config.logs_latency),
            }),
            ready_rx: Some(ready_rx),
            ..Default::default()
        };

        Ok(Self {
            shared,
            control: Arc::new(Mutex::new(control)),
        })
    }

    /// Producer side of the packet ingestion channel.
    pub fn sender(&self) -> mpsc::Sender<DnsPacket> {
        self.shared.msg_tx.clone()
    }

    /// The "updates ready" signal. Can be taken once.
    pub fn updates_ready(&self) -> Option<mpsc::Receiver<()>> {
        self.control.lock().ready_rx.take()
    }

    pub fn lookup(&self) -> DomainLookup {
        DomainLookup {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn DomainChangeHandler>) {
        self.shared.state.write().handlers.push(handler);
    }

    /// Restore persisted mappings and spawn the main loop on the current
    /// tokio runtime.
    pub fn start(&self) -> Result<()> {
        info!("Starting domain info store");

        if let Some(dir) = self.shared.settings.cache_file.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StoreError::runtime(format!(
                        "failed to create persistent file dir {}: {e}",
                        dir.display()
                    ))
                })?;
            }
        }

        let parts = self
            .control
            .lock()
            .pending
            .take()
            .ok_or_else(|| StoreError::runtime("domain info store already started"))?;

        self.shared.load_mappings();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(MainLoop::new(self.shared.clone(), parts).run(shutdown_rx));

        let mut control = self.control.lock();
        control.shutdown_tx = Some(shutdown_tx);
        control.task = Some(task);
        Ok(())
    }

    /// Stop the main loop, which saves the mappings on its way out.
    pub async fn stop(&self) {
        let (shutdown_tx, task) = {
            let mut control = self.control.lock();
            (control.shutdown_tx.take(), control.task.take())
        };
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Domain info store loop ended abnormally: {}", e);
            }
        }
    }

    /// Apply a hot config change. A new epoch discards every cached mapping.
    pub fn on_config_update(&self, update: ConfigUpdate) {
        let mut state = self.shared.state.write();
        if update.epoch != state.epoch {
            info!(
                "Update epoch ({}->{}) and send trigger to clear cache",
                state.epoch, update.epoch
            );
            state.epoch = update.epoch;
            if self.shared.reset_tx.try_send(()).is_err() {
                debug!("Cache reset already pending");
            }
        }
        if update.extra_ttl != state.extra_ttl {
            info!(extra_ttl = ?update.extra_ttl, "Extra TTL updated");
            state.extra_ttl = update.extra_ttl;
        }
    }

    /// Run the change handlers for everything changed since the last call.
    ///
    /// Returns `true` when the dataplane must program changes and then call
    /// [`updates_applied`](Self::updates_applied). On `false` that has
    /// already happened.
    pub fn handle_updates(&self) -> bool {
        debug!("HandleUpdates called from dataplane");
        let (changed, handlers) = {
            let mut state = self.shared.state.write();
            let changed = state.sequencer.begin_handle();
            (changed, state.handlers.clone())
        };

        let mut needs_sync = false;
        for name in &changed {
            for handler in &handlers {
                if handler.on_domain_change(name) {
                    needs_sync = true;
                }
            }
        }

        let needs_sync = {
            let mut state = self.shared.state.write();
            if needs_sync {
                state.sequencer.set_needs_dataplane_sync();
            }
            state.sequencer.needs_dataplane_sync()
        };
        if !needs_sync {
            debug!("No dataplane syncs are required");
            self.updates_applied();
            return false;
        }
        debug!("Dataplane syncs are required");
        true
    }

    /// Everything handled so far is programmed; release the waiting packets.
    pub fn updates_applied(&self) {
        let callbacks = {
            let mut state = self.shared.state.write();
            let callbacks = state.sequencer.mark_applied();
            debug!(
                applied = state.sequencer.applied_revision(),
                released = callbacks.len(),
                "Dataplane updates have been applied"
            );
            callbacks
        };
        self.shared.releaser.release(callbacks);
    }

    pub fn get_domain_ips(&self, domain: &str) -> Vec<String> {
        self.shared.state.write().get_domain_ips(domain)
    }

    /// Call `f` with each watched domain that leads to `ip`, until it returns `true`.
    pub fn iter_watched_domains_for_ip<F>(&self, client: &ClientKey, ip: IpAddr, f: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.shared
            .state
            .read()
            .iter_watched_domains_for_ip(client, ip, f);
    }

    pub fn get_top_level_domains_for_ip(&self, client: &ClientKey, ip: IpAddr) -> Arc<[String]> {
        self.shared.state.read().top_level_domains_for_ip(client, ip)
    }

    pub fn save_mappings(&self) -> Result<()> {
        self.shared
            .state
            .read()
            .save_mappings(&self.shared.settings.cache_file)
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }
}

#[cfg(test)]
impl DomainInfoStore {
    /// Feed a decoded response without going through the main loop.
    pub(crate) fn inject_response(&self, client: &ClientKey, message: &Message) -> u64 {
        self.shared.process_dns_response(client, message, None)
    }

    pub(crate) fn inject_response_with_callback(
        &self,
        client: &ClientKey,
        message: &Message,
        callback: ReleaseCallback,
    ) -> u64 {
        self.shared.process_dns_response(client, message, Some(callback))
    }

    pub(crate) fn expire_everything(&self) {
        self.shared.expire_all();
    }
}

impl Shared {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.state.read().clock.now()
    }

    pub(crate) fn client_key(&self, destination: IpAddr) -> ClientKey {
        if self.settings.dest_domains_by_client {
            ClientKey::Ip(destination)
        } else {
            ClientKey::DefaultGroup
        }
    }

    fn load_mappings(&self) {
        let path = &self.settings.cache_file;
        let result = self.state.write().read_mappings(path);
        match result {
            Ok(restored) => {
                info!(file = %path.display(), restored, "Restored DNS mappings");
                self.maybe_signal_updates_ready("mapping loaded");
            }
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %path.display(), "No saved DNS mappings");
            }
            Err(e) => warn!("Failed to read mappings from file: {}", e),
        }
    }

    pub(crate) fn save_logged(&self) {
        if let Err(e) = self.state.read().save_mappings(&self.settings.cache_file) {
            warn!("Failed to save mappings to file: {}", e);
        }
    }

    /// Store every A, AAAA and CNAME record of a response for `client`.
    /// Returns the highest revision any of them produced.
    pub(crate) fn store_response_records(&self, client: &ClientKey, message: &Message) -> u64 {
        debug!(
            answers = message.answers().len(),
            additionals = message.additionals().len(),
            "DNS response"
        );
        let mut state = self.state.write();
        let answers = message.answers().iter().map(|r| (r, "answer"));
        let additionals = message.additionals().iter().map(|r| (r, "additional"));
        answers
            .chain(additionals)
            .map(|(record, section)| store_dns_record(&mut state, client, record, section))
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn has_pending_changes(&self) -> bool {
        self.state.read().sequencer.has_changes()
    }

    pub(crate) fn maybe_signal_updates_ready(&self, reason: &str) {
        if !self.has_pending_changes() {
            debug!("No changed names");
            return;
        }
        match self.ready_tx.try_send(()) {
            Ok(()) => debug!(reason, "Sent update ready notification"),
            Err(_) => debug!(
                reason,
                "Update ready notification already pending, updates will be handled together"
            ),
        }
    }

    pub(crate) fn attach_callback(&self, revision: u64, callback: ReleaseCallback) {
        let (placement, now) = self.state.write().sequencer.attach(revision, callback);
        if let Some(callback) = now {
            debug_assert_eq!(placement, CallbackPlacement::Immediate);
            self.releaser.release(vec![callback]);
        }
    }

    pub(crate) fn release_now(&self, callback: Option<ReleaseCallback>) {
        if let Some(callback) = callback {
            debug!("Releasing packet immediately");
            self.releaser.release(vec![callback]);
        }
    }

    /// Store a decoded response, signal, and queue its release callback.
    pub(crate) fn process_dns_response(
        &self,
        client: &ClientKey,
        message: &Message,
        callback: Option<ReleaseCallback>,
    ) -> u64 {
        let revision = self.store_response_records(client, message);
        self.maybe_signal_updates_ready("mapping added");
        if let Some(callback) = callback {
            self.attach_callback(revision, callback);
        }
        revision
    }

    pub(crate) fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.state.read().expiry.next_deadline()
    }

    pub(crate) fn process_expiries(&self) {
        let expired = {
            let mut state = self.state.write();
            let now = state.clock.now();
            state.expire_due(now)
        };
        if expired > 0 {
            debug!(expired, "Expired DNS mappings");
            self.maybe_signal_updates_ready("mapping expired");
        }
    }

    pub(crate) fn expire_all(&self) {
        info!("Expiring all DNS mappings");
        self.state.write().expire_all_mappings();
        self.maybe_signal_updates_ready("epoch changed");
    }

    pub(crate) fn collect_garbage(&self) -> usize {
        self.state.write().collect_garbage()
    }
}

fn store_dns_record(
    state: &mut StoreState,
    client: &ClientKey,
    record: &Record,
    section: &str,
) -> u64 {
    let name = decode::normalize_name(record.name());
    if record.dns_class() != DNSClass::IN {
        debug!(section, %name, class = ?record.dns_class(), "Ignoring non-IN DNS record");
        return 0;
    }

    let ttl = Duration::from_secs(u64::from(record.ttl()));
    match record.data() {
        RData::A(a) => state.store_info(client, &name, &a.0.to_string(), ttl, false),
        RData::AAAA(aaaa) => state.store_info(client, &name, &aaaa.0.to_string(), ttl, false),
        RData::CNAME(cname) => {
            let target = decode::normalize_name(&cname.0);
            state.store_info(client, &name, &target, ttl, true)
        }
        other => {
            debug!(section, %name, record_type = %other.record_type(), "Ignoring DNS record");
            0
        }
    }
}
