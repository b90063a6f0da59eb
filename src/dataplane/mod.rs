/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Dataplane side of the update handshake.
//!
//! [`IpSetsHandler`] turns domain change notifications into IP set
//! membership diffs for one address family. [`DataplaneDriver`] waits for
//! "updates ready", runs the handlers through the store, pushes the diffs
//! to an [`IpSetBackend`] and then reports the updates as applied. A diff
//! the backend rejects goes back into the handler and the packets stay held
//! until a later attempt programs it.

use crate::core::error::Result;
use crate::store::{DomainChangeHandler, DomainInfoStore, DomainLookup};
use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Delay before reprogramming a diff the backend rejected.
const APPLY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn matches(self, ip: &IpAddr) -> bool {
        match self {
            IpFamily::V4 => ip.is_ipv4(),
            IpFamily::V6 => ip.is_ipv6(),
        }
    }
}

/// Programs IP set membership changes.
#[async_trait]
pub trait IpSetBackend: Send + Sync + 'static {
    async fn apply(&self, set_name: &str, added: &[IpAddr], removed: &[IpAddr]) -> Result<()>;
}

/// Backend that only logs the membership changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingIpSetBackend;

#[async_trait]
impl IpSetBackend for TracingIpSetBackend {
    async fn apply(&self, set_name: &str, added: &[IpAddr], removed: &[IpAddr]) -> Result<()> {
        info!(set = %set_name, ?added, ?removed, "IP set membership updated");
        Ok(())
    }
}

/// Membership changes not yet handed to the backend.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub added: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
}

impl PendingUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct SetState {
    /// Current IPs of each watched domain.
    domain_ips: AHashMap<String, AHashSet<IpAddr>>,
    /// Set members with the number of watched domains contributing them.
    members: AHashMap<IpAddr, usize>,
    pending_add: AHashSet<IpAddr>,
    pending_remove: AHashSet<IpAddr>,
}

impl SetState {
    fn add_member(&mut self, ip: IpAddr) -> bool {
        let count = self.members.entry(ip).or_insert(0);
        *count += 1;
        if *count > 1 {
            return false;
        }
        if !self.pending_remove.remove(&ip) {
            self.pending_add.insert(ip);
        }
        true
    }

    fn remove_member(&mut self, ip: IpAddr) -> bool {
        let Some(count) = self.members.get_mut(&ip) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.members.remove(&ip);
        if !self.pending_add.remove(&ip) {
            self.pending_remove.insert(ip);
        }
        true
    }

    /// Merge an unprogrammed diff back under whatever changed since it was taken.
    fn restore(&mut self, update: &PendingUpdate) {
        for ip in &update.added {
            if !self.pending_remove.remove(ip) {
                self.pending_add.insert(*ip);
            }
        }
        for ip in &update.removed {
            if !self.pending_add.remove(ip) {
                self.pending_remove.insert(*ip);
            }
        }
    }
}

/// Keeps one IP set in step with the addresses of a list of watched domains.
pub struct IpSetsHandler {
    set_name: String,
    family: IpFamily,
    lookup: DomainLookup,
    domains: AHashSet<String>,
    state: Mutex<SetState>,
}

impl IpSetsHandler {
    pub fn new<I, S>(set_name: &str, family: IpFamily, lookup: DomainLookup, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            set_name: set_name.to_string(),
            family,
            lookup,
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().to_lowercase())
                .collect(),
            state: Mutex::new(SetState::default()),
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Query every watched domain once. This also registers the domains with
    /// the store so their later changes are reported.
    pub fn prime(&self) -> bool {
        let mut changed = false;
        for domain in &self.domains {
            changed |= self.refresh(domain);
        }
        changed
    }

    /// Current set members, sorted.
    pub fn members(&self) -> Vec<IpAddr> {
        let mut members: Vec<IpAddr> = self.state.lock().members.keys().copied().collect();
        members.sort();
        members
    }

    pub fn take_pending(&self) -> PendingUpdate {
        let mut state = self.state.lock();
        let mut added: Vec<IpAddr> = state.pending_add.drain().collect();
        let mut removed: Vec<IpAddr> = state.pending_remove.drain().collect();
        added.sort();
        removed.sort();
        PendingUpdate { added, removed }
    }

    /// Put back a diff taken with [`take_pending`](Self::take_pending) that
    /// never reached the dataplane.
    pub fn restore_pending(&self, update: &PendingUpdate) {
        self.state.lock().restore(update);
    }

    fn refresh(&self, domain: &str) -> bool {
        let current: AHashSet<IpAddr> = self
            .lookup
            .get_domain_ips(domain)
            .iter()
            .filter_map(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(%domain, %ip, "ignoring unparseable IP: {}", e);
                    None
                }
            })
            .filter(|ip| self.family.matches(ip))
            .collect();

        let mut state = self.state.lock();
        let previous = state.domain_ips.remove(domain).unwrap_or_default();

        let mut changed = false;
        for ip in current.difference(&previous) {
            changed |= state.add_member(*ip);
        }
        for ip in previous.difference(&current) {
            changed |= state.remove_member(*ip);
        }
        if !current.is_empty() {
            state.domain_ips.insert(domain.to_string(), current);
        }

        if changed {
            debug!(set = %self.set_name, %domain, "IP set membership changed");
        }
        changed
    }
}

impl DomainChangeHandler for IpSetsHandler {
    fn on_domain_change(&self, name: &str) -> bool {
        if !self.domains.contains(name) {
            return false;
        }
        self.refresh(name)
    }
}

/// Runs the handle/applied handshake on behalf of the IP set handlers.
pub struct DataplaneDriver {
    store: DomainInfoStore,
    handlers: Vec<Arc<IpSetsHandler>>,
    backend: Arc<dyn IpSetBackend>,
}

impl DataplaneDriver {
    pub fn new(
        store: DomainInfoStore,
        handlers: Vec<Arc<IpSetsHandler>>,
        backend: Arc<dyn IpSetBackend>,
    ) -> Self {
        Self {
            store,
            handlers,
            backend,
        }
    }

    /// Prime every handler and program what it found. Whatever the backend
    /// rejects is kept for the first sync.
    pub async fn prime(&self) {
        for handler in &self.handlers {
            handler.prime();
        }
        if self.apply_pending().await.is_err() {
            warn!("Initial IP set programming failed; will retry on next sync");
        }
    }

    /// Process ready signals until shutdown or until the store goes away.
    pub async fn run(self, mut ready: mpsc::Receiver<()>, mut shutdown: oneshot::Receiver<()>) {
        info!(sets = self.handlers.len(), "Dataplane driver started");
        let mut retry = false;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                signal = ready.recv() => match signal {
                    Some(()) => retry = self.sync().await.is_err(),
                    None => break,
                },
                _ = tokio::time::sleep(APPLY_RETRY_INTERVAL), if retry => {
                    debug!("Retrying IP set programming");
                    retry = self.program().await.is_err();
                }
            }
        }
        info!("Dataplane driver stopped");
    }

    /// One handshake round. On error the held packets stay held and the
    /// unprogrammed diffs stay queued in their handlers.
    pub async fn sync(&self) -> Result<()> {
        if !self.store.handle_updates() {
            return Ok(());
        }
        self.program().await
    }

    /// Program every queued diff and, only if all of them landed, report
    /// the handled updates as applied.
    async fn program(&self) -> Result<()> {
        self.apply_pending().await?;
        self.store.updates_applied();
        Ok(())
    }

    /// Hand each handler's diff to the backend. A rejected diff is restored
    /// into its handler; the first error is returned once every set was tried.
    async fn apply_pending(&self) -> Result<()> {
        let mut first_error = None;
        for handler in &self.handlers {
            let pending = handler.take_pending();
            if pending.is_empty() {
                continue;
            }
            if let Err(e) = self
                .backend
                .apply(handler.set_name(), &pending.added, &pending.removed)
                .await
            {
                warn!(set = %handler.set_name(), "Failed to program IP set: {}", e);
                handler.restore_pending(&pending);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
