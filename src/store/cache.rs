/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-client record cache.
//!
//! Each client owns a forward map (`name -> values`) and a reverse index
//! (`ip -> names`). CNAME values link names inside one client's forward map;
//! clients never share entries.

use crate::core::clock::Clock;
use crate::store::expiry::{ExpiryQueue, MappingKey};
use crate::store::revision::RevisionSequencer;
use crate::store::wildcard::{WildcardCache, is_wildcard};
use crate::store::{ClientKey, DomainChangeHandler};
use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Answers carrying this address are never cached.
pub(crate) const ZERO_IP: &str = "0.0.0.0";

/// Floor applied to every stored TTL.
pub(crate) const MIN_TTL: Duration = Duration::from_secs(2);

#[inline]
pub(crate) fn no_domains() -> Arc<[String]> {
    Arc::from(Vec::new())
}

/// Absolute expiry for a mapping stored at `now`, saturating instead of overflowing.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueEntry {
    pub(crate) expiry: DateTime<Utc>,
    /// CNAME target rather than an address.
    pub(crate) is_name: bool,
}

#[derive(Debug)]
pub(crate) struct NameEntry {
    pub(crate) values: AHashMap<String, ValueEntry>,
    /// Most-recent-first, capped; only ever replaced, never edited in place.
    pub(crate) top_level_domains: Arc<[String]>,
    /// Queried domains (and wildcards) whose answer depends on this name.
    pub(crate) names_to_notify: AHashSet<String>,
    /// Revision at which this name last gained a value.
    pub(crate) revision: u64,
}

impl NameEntry {
    pub(crate) fn new(top_level_domains: Arc<[String]>) -> Self {
        Self {
            values: AHashMap::new(),
            top_level_domains,
            names_to_notify: AHashSet::new(),
            revision: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct IpEntry {
    pub(crate) names: AHashSet<String>,
    pub(crate) top_level_domains: Arc<[String]>,
}

#[derive(Debug, Default)]
pub(crate) struct ClientLookup {
    pub(crate) mappings: AHashMap<String, NameEntry>,
    pub(crate) reverse: AHashMap<IpAddr, IpEntry>,
}

/// Everything guarded by the store lock.
pub(crate) struct StoreState {
    pub(crate) clients: AHashMap<ClientKey, ClientLookup>,
    pub(crate) wildcards: WildcardCache,
    /// Memoized `get_domain_ips` answers, dropped when a dependency changes.
    pub(crate) results: AHashMap<String, Vec<String>>,
    pub(crate) sequencer: RevisionSequencer,
    pub(crate) expiry: ExpiryQueue,
    pub(crate) handlers: Vec<Arc<dyn DomainChangeHandler>>,
    pub(crate) extra_ttl: Duration,
    pub(crate) epoch: i64,
    pub(crate) max_top_level_domains: usize,
    /// Set while persisted mappings are loaded.
    pub(crate) reading_mappings: bool,
    /// Set when a mapping is removed; lets GC skip idle passes.
    pub(crate) gc_trigger: bool,
    pub(crate) clock: Arc<dyn Clock>,
}

impl StoreState {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        epoch: i64,
        extra_ttl: Duration,
        max_top_level_domains: usize,
    ) -> Self {
        Self {
            clients: AHashMap::new(),
            wildcards: WildcardCache::default(),
            results: AHashMap::new(),
            sequencer: RevisionSequencer::default(),
            expiry: ExpiryQueue::default(),
            handlers: Vec::new(),
            extra_ttl,
            epoch,
            max_top_level_domains,
            reading_mappings: false,
            gc_trigger: false,
            clock,
        }
    }

    /// Record one `name -> value` mapping for `client`.
    ///
    /// Returns the revision at which the mapping became visible, or 0 when
    /// nothing was stored.
    pub(crate) fn store_info(
        &mut self,
        client: &ClientKey,
        name: &str,
        value: &str,
        ttl: Duration,
        is_name: bool,
    ) -> u64 {
        if value == ZERO_IP {
            debug!(name, "ignoring zero IP");
            return 0;
        }

        let ttl = ttl.saturating_add(self.extra_ttl).max(MIN_TTL);
        let expiry = expiry_after(self.clock.now(), ttl);
        let max = self.max_top_level_domains;
        let reading = self.reading_mappings;

        let lookup = self.clients.entry(client.clone()).or_default();
        let entry = lookup.mappings.entry(name.to_string()).or_insert_with(|| {
            if reading {
                NameEntry::new(no_domains())
            } else {
                NameEntry::new(Arc::from(vec![name.to_string()]))
            }
        });

        if let Some(existing) = entry.values.get_mut(value) {
            // The scheduled deadline stays put; `expire_due` reschedules it.
            if expiry > existing.expiry {
                debug!(name, value, %expiry, "extending mapping expiry");
                existing.expiry = expiry;
            }
            return entry.revision;
        }

        if entry.values.is_empty() {
            for wildcard in self.wildcards.matching(name) {
                entry.names_to_notify.insert(wildcard.clone());
            }
        }

        debug!(?client, name, value, is_name, ?ttl, "storing mapping");
        entry
            .values
            .insert(value.to_string(), ValueEntry { expiry, is_name });
        let top_level_domains = entry.top_level_domains.clone();
        self.expiry
            .schedule(expiry, mapping_key(client, name, value));

        if is_name {
            if lookup.mappings.contains_key(value) {
                propagate_top_level_domains(lookup, value, &top_level_domains, max);
            } else {
                lookup
                    .mappings
                    .insert(value.to_string(), NameEntry::new(top_level_domains));
            }
        } else {
            add_ip_mapping(&mut lookup.reverse, name, value, &top_level_domains, max);
        }

        self.compile_changed_names(client, name);

        let revision = self.sequencer.current_revision();
        if let Some(entry) = self
            .clients
            .get_mut(client)
            .and_then(|lookup| lookup.mappings.get_mut(name))
        {
            entry.revision = revision;
        }
        revision
    }

    /// Mark `name` and every domain that depends on it as changed.
    pub(crate) fn compile_changed_names(&mut self, client: &ClientKey, name: &str) {
        self.sequencer.mark_changed(name);
        self.results.remove(name);

        let Some(entry) = self
            .clients
            .get(client)
            .and_then(|lookup| lookup.mappings.get(name))
        else {
            return;
        };
        for ancestor in &entry.names_to_notify {
            self.sequencer.mark_changed(ancestor);
            self.results.remove(ancestor);
        }
    }

    /// Every IP `domain` currently resolves to, across all clients.
    ///
    /// The query also registers `domain` on each name it walks through so
    /// later changes to those names are reported against `domain`.
    pub(crate) fn get_domain_ips(&mut self, domain: &str) -> Vec<String> {
        let domain = domain.to_lowercase();
        if let Some(ips) = self.results.get(&domain) {
            return ips.clone();
        }

        let mut ips = Vec::new();
        for lookup in self.clients.values_mut() {
            collect_ips(lookup, &domain, &domain, &mut ips);
        }

        if is_wildcard(&domain) {
            match self.wildcards.get_or_compile(&domain) {
                Ok(regex) => {
                    for lookup in self.clients.values_mut() {
                        let matched: Vec<String> = lookup
                            .mappings
                            .keys()
                            .filter(|name| regex.is_match(name))
                            .cloned()
                            .collect();
                        for name in matched {
                            collect_ips(lookup, &name, &domain, &mut ips);
                        }
                    }
                }
                Err(e) => warn!(wildcard = %domain, "failed to compile wildcard: {}", e),
            }
        }

        let mut seen = AHashSet::new();
        ips.retain(|ip| seen.insert(ip.clone()));
        debug!(domain = %domain, ?ips, "resolved domain");
        self.results.insert(domain, ips.clone());
        ips
    }

    /// Call `f` with each watched domain that leads to `ip` for `client`,
    /// stopping at the first `true`.
    pub(crate) fn iter_watched_domains_for_ip<F>(&self, client: &ClientKey, ip: IpAddr, mut f: F)
    where
        F: FnMut(&str) -> bool,
    {
        let Some(lookup) = self.clients.get(client) else {
            return;
        };
        let Some(ip_entry) = lookup.reverse.get(&ip) else {
            return;
        };
        for name in &ip_entry.names {
            let Some(entry) = lookup.mappings.get(name) else {
                continue;
            };
            for domain in &entry.names_to_notify {
                if f(domain) {
                    return;
                }
            }
        }
    }

    pub(crate) fn top_level_domains_for_ip(&self, client: &ClientKey, ip: IpAddr) -> Arc<[String]> {
        self.clients
            .get(client)
            .and_then(|lookup| lookup.reverse.get(&ip))
            .map(|ip_entry| ip_entry.top_level_domains.clone())
            .unwrap_or_else(no_domains)
    }

    /// Process every deadline at or before `now`. A mapping refreshed since
    /// it was scheduled goes back on the queue at its new expiry, so each
    /// value holds exactly one queue entry. Returns how many were removed.
    pub(crate) fn expire_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for key in self.expiry.pop_due(now) {
            if self.process_mapping_expiry(&key, now) {
                expired += 1;
                continue;
            }
            let live = self
                .clients
                .get(&key.client)
                .and_then(|lookup| lookup.mappings.get(&key.name))
                .and_then(|entry| entry.values.get(&key.value))
                .map(|value| value.expiry);
            if let Some(at) = live {
                self.expiry.schedule(at, key);
            }
        }
        expired
    }

    /// Drop one mapping if its expiry has passed. A refreshed mapping is kept.
    pub(crate) fn process_mapping_expiry(&mut self, key: &MappingKey, now: DateTime<Utc>) -> bool {
        let Some(lookup) = self.clients.get_mut(&key.client) else {
            return false;
        };
        let Some(entry) = lookup.mappings.get_mut(&key.name) else {
            return false;
        };
        let Some(value) = entry.values.get(&key.value) else {
            return false;
        };
        if value.expiry > now {
            return false;
        }

        let is_name = value.is_name;
        entry.values.remove(&key.value);
        if !is_name {
            remove_ip_mapping(&mut lookup.reverse, &key.name, &key.value);
        }
        debug!(client = ?key.client, name = %key.name, value = %key.value, "mapping expired");

        self.gc_trigger = true;
        self.compile_changed_names(&key.client, &key.name);
        true
    }

    /// Expire every value of every client. Entries stay for GC to collect.
    pub(crate) fn expire_all_mappings(&mut self) {
        let mut changed = Vec::new();
        for (client, lookup) in self.clients.iter_mut() {
            for (name, entry) in lookup.mappings.iter_mut() {
                if entry.values.is_empty() {
                    continue;
                }
                entry.values.clear();
                changed.push((client.clone(), name.clone()));
            }
            lookup.reverse.clear();
        }
        self.expiry.clear();

        for (client, name) in &changed {
            self.compile_changed_names(client, name);
        }
        self.gc_trigger = true;
    }

    /// After a load, seed each root name (one no CNAME points at) as its
    /// own top-level domain and push that down its chains.
    pub(crate) fn propagate_root_domains(&mut self) {
        let max = self.max_top_level_domains;
        for lookup in self.clients.values_mut() {
            let mut has_parent = AHashSet::new();
            for entry in lookup.mappings.values() {
                for (value, value_entry) in &entry.values {
                    if value_entry.is_name {
                        has_parent.insert(value.clone());
                    }
                }
            }

            let roots: Vec<String> = lookup
                .mappings
                .keys()
                .filter(|name| !has_parent.contains(*name))
                .cloned()
                .collect();
            for root in roots {
                let own: Arc<[String]> = Arc::from(vec![root.clone()]);
                propagate_top_level_domains(lookup, &root, &own, max);
            }
        }
    }

    pub(crate) fn mapping_count(&self) -> usize {
        self.clients
            .values()
            .map(|lookup| lookup.mappings.len())
            .sum()
    }
}

fn mapping_key(client: &ClientKey, name: &str, value: &str) -> MappingKey {
    MappingKey {
        client: client.clone(),
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Walk the CNAME graph from `start`, collecting IPs and registering
/// `domain` on every visited name. Each name is visited once per call.
fn collect_ips(lookup: &mut ClientLookup, start: &str, domain: &str, ips: &mut Vec<String>) {
    let mut visited = AHashSet::new();
    let mut pending = vec![start.to_string()];

    while let Some(name) = pending.pop() {
        if visited.contains(&name) {
            warn!(%name, %domain, "CNAME loop detected");
            continue;
        }
        let Some(entry) = lookup.mappings.get_mut(&name) else {
            visited.insert(name);
            continue;
        };
        if !entry.names_to_notify.contains(domain) {
            entry.names_to_notify.insert(domain.to_string());
        }
        for (value, value_entry) in &entry.values {
            if value_entry.is_name {
                pending.push(value.clone());
            } else {
                ips.push(value.clone());
            }
        }
        visited.insert(name);
    }
}

/// Merge `tlds` into every name reachable from `start` and into the reverse
/// entries of their IPs.
pub(crate) fn propagate_top_level_domains(
    lookup: &mut ClientLookup,
    start: &str,
    tlds: &Arc<[String]>,
    max: usize,
) {
    let ClientLookup { mappings, reverse } = lookup;
    let mut handled = AHashSet::new();
    let mut pending = vec![start.to_string()];

    while let Some(name) = pending.pop() {
        if !handled.insert(name.clone()) {
            continue;
        }
        let Some(entry) = mappings.get_mut(&name) else {
            continue;
        };
        entry.top_level_domains = combine_top_level_domains(tlds, &entry.top_level_domains, max);

        for (value, value_entry) in &entry.values {
            if value_entry.is_name {
                pending.push(value.clone());
                continue;
            }
            let Ok(ip) = value.parse::<IpAddr>() else {
                warn!(%value, "cached IP value does not parse");
                continue;
            };
            if let Some(ip_entry) = reverse.get_mut(&ip) {
                ip_entry.top_level_domains =
                    combine_top_level_domains(tlds, &ip_entry.top_level_domains, max);
            }
        }
    }
}

fn add_ip_mapping(
    reverse: &mut AHashMap<IpAddr, IpEntry>,
    name: &str,
    value: &str,
    tlds: &Arc<[String]>,
    max: usize,
) {
    let Ok(ip) = value.parse::<IpAddr>() else {
        warn!(name, value, "not storing unparseable IP");
        return;
    };
    match reverse.get_mut(&ip) {
        Some(ip_entry) => {
            ip_entry.top_level_domains =
                combine_top_level_domains(tlds, &ip_entry.top_level_domains, max);
            ip_entry.names.insert(name.to_string());
        }
        None => {
            let mut names = AHashSet::new();
            names.insert(name.to_string());
            reverse.insert(
                ip,
                IpEntry {
                    names,
                    top_level_domains: tlds.clone(),
                },
            );
        }
    }
}

fn remove_ip_mapping(reverse: &mut AHashMap<IpAddr, IpEntry>, name: &str, value: &str) {
    let Ok(ip) = value.parse::<IpAddr>() else {
        return;
    };
    if let Some(ip_entry) = reverse.get_mut(&ip) {
        ip_entry.names.remove(name);
        if ip_entry.names.is_empty() {
            reverse.remove(&ip);
        }
    }
}

/// Merge two top-level domain lists: `primary` first, then whatever of
/// `secondary` it lacks, capped at `max`.
pub(crate) fn combine_top_level_domains(
    primary: &Arc<[String]>,
    secondary: &Arc<[String]>,
    max: usize,
) -> Arc<[String]> {
    if primary.is_empty() {
        return secondary.clone();
    }
    if secondary.is_empty() {
        return primary.clone();
    }
    if primary.len() >= max {
        return Arc::from(&primary[..max]);
    }

    let mut missing = Vec::new();
    for name in secondary.iter() {
        if primary.len() + missing.len() >= max {
            break;
        }
        if !primary.contains(name) {
            missing.push(name.clone());
        }
    }
    if missing.is_empty() {
        return primary.clone();
    }

    let mut combined = primary.to_vec();
    combined.extend(missing);
    Arc::from(combined)
}
