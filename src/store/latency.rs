/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Request/response pairing for DNS latency.
//!
//! Requests and responses are captured by different paths and can arrive in
//! either order. An exchange is keyed by client IP and DNS ID; an unpaired
//! request is held for up to 10s, an unpaired response for up to 1s.
//! Latency is the difference of the two capture timestamps, which are
//! nanoseconds from an arbitrary base.

use crate::core::log::RateLimitedLog;
use crate::store::decode::DnsPacketInfo;
use ahash::AHashMap;
use hickory_proto::op::Message;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) const MAX_HOLD_REQUEST: Duration = Duration::from_secs(10);
pub(crate) const MAX_HOLD_RESPONSE: Duration = Duration::from_secs(1);
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const MISSED_LOG_INTERVAL: Duration = Duration::from_secs(120);

/// Receives one call per DNS response seen.
pub trait DnsLogSink: Send + Sync + 'static {
    fn log_dns(&self, server: IpAddr, client: IpAddr, message: &Message, latency: Option<Duration>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExchangeKey {
    client: IpAddr,
    id: u16,
}

#[derive(Debug)]
enum Held {
    Request {
        queued_ms: i64,
        packet_ts: u64,
    },
    Response {
        queued_ms: i64,
        packet_ts: u64,
        server: IpAddr,
        client: IpAddr,
        /// `None` once the response has already been logged.
        message: Option<Message>,
    },
}

pub(crate) struct LatencyCorrelator {
    sink: Option<Arc<dyn DnsLogSink>>,
    measure: bool,
    held: AHashMap<ExchangeKey, Held>,
    no_request_log: RateLimitedLog,
    no_response_log: RateLimitedLog,
}

fn latency_between(earlier: u64, later: u64) -> Duration {
    Duration::from_nanos(later.saturating_sub(earlier))
}

impl LatencyCorrelator {
    pub(crate) fn new(sink: Option<Arc<dyn DnsLogSink>>, logs_latency: bool) -> Self {
        let measure = logs_latency && sink.is_some();
        Self {
            sink,
            measure,
            held: AHashMap::new(),
            no_request_log: RateLimitedLog::new(MISSED_LOG_INTERVAL),
            no_response_log: RateLimitedLog::new(MISSED_LOG_INTERVAL),
        }
    }

    #[inline]
    pub(crate) fn measuring(&self) -> bool {
        self.measure
    }

    fn log(&self, server: IpAddr, client: IpAddr, message: &Message, latency: Option<Duration>) {
        if let Some(sink) = &self.sink {
            sink.log_dns(server, client, message, latency);
        }
    }

    pub(crate) fn on_request(&mut self, packet: &DnsPacketInfo, timestamp: u64, now_ms: i64) {
        if !self.measure {
            return;
        }
        let id = packet.message.id();
        if timestamp == 0 {
            debug!(id, "DNS-LATENCY: missing timestamp on DNS request");
        }

        let key = ExchangeKey {
            client: packet.src,
            id,
        };
        let request = Held::Request {
            queued_ms: now_ms,
            packet_ts: timestamp,
        };
        match self.held.remove(&key) {
            None => {
                debug!(?key, "DNS-LATENCY: received DNS request");
                self.held.insert(key, request);
            }
            Some(Held::Request { .. }) => {
                warn!(?key, "DNS-LATENCY: received DNS request but already have DNS request");
                self.held.insert(key, request);
            }
            Some(Held::Response { message: None, .. }) => {
                debug!(?key, "DNS-LATENCY: received DNS request for already logged response");
            }
            Some(Held::Response {
                message: Some(message),
                packet_ts,
                ..
            }) => {
                let latency = (timestamp != 0).then(|| latency_between(timestamp, packet_ts));
                debug!(?key, ?latency, "DNS-LATENCY: received DNS request after its response");
                self.log(packet.dst, packet.src, &message, latency);
            }
        }
    }

    pub(crate) fn on_response(&mut self, packet: &DnsPacketInfo, timestamp: u64, now_ms: i64) {
        if self.sink.is_none() {
            return;
        }
        let (server, client) = (packet.src, packet.dst);
        if !self.measure {
            self.log(server, client, &packet.message, None);
            return;
        }

        let id = packet.message.id();
        let key = ExchangeKey { client, id };
        let logged_now = timestamp == 0;
        if logged_now {
            debug!(id, "DNS-LATENCY: missing timestamp on DNS response");
            self.log(server, client, &packet.message, None);
        }

        let response = || Held::Response {
            queued_ms: now_ms,
            packet_ts: timestamp,
            server,
            client,
            message: (!logged_now).then(|| packet.message.clone()),
        };
        match self.held.remove(&key) {
            None => {
                debug!(?key, "DNS-LATENCY: received DNS response with no request");
                self.held.insert(key, response());
            }
            Some(Held::Response {
                server: prev_server,
                client: prev_client,
                message: prev,
                ..
            }) => {
                warn!(?key, "DNS-LATENCY: received DNS response but already have DNS response");
                if let Some(prev) = prev {
                    self.log(prev_server, prev_client, &prev, None);
                }
                self.held.insert(key, response());
            }
            Some(Held::Request { packet_ts, .. }) => {
                if logged_now {
                    debug!(?key, "DNS-LATENCY: received DNS response and have request (no latency)");
                } else if packet_ts == 0 {
                    debug!(?key, "DNS-LATENCY: request had no timestamp");
                    self.log(server, client, &packet.message, None);
                } else {
                    let latency = latency_between(packet_ts, timestamp);
                    debug!(?key, ?latency, "DNS-LATENCY: received DNS response and have request");
                    self.log(server, client, &packet.message, Some(latency));
                }
            }
        }
    }

    /// Drop requests held too long and log responses that never met a request.
    pub(crate) fn sweep(&mut self, now_ms: i64) {
        if !self.measure {
            return;
        }
        let request_cutoff = now_ms - MAX_HOLD_REQUEST.as_millis() as i64;
        let response_cutoff = now_ms - MAX_HOLD_RESPONSE.as_millis() as i64;

        let expired: Vec<ExchangeKey> = self
            .held
            .iter()
            .filter(|(_, held)| match held {
                Held::Request { queued_ms, .. } => *queued_ms < request_cutoff,
                Held::Response { queued_ms, .. } => *queued_ms < response_cutoff,
            })
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            match self.held.remove(&key) {
                Some(Held::Request { .. }) => {
                    if let Some(suppressed) = self.no_response_log.check() {
                        warn!(?key, suppressed, "DNS-LATENCY: missed DNS response for request");
                    }
                }
                Some(Held::Response {
                    server,
                    client,
                    message: Some(message),
                    ..
                }) => {
                    if let Some(suppressed) = self.no_request_log.check() {
                        debug!(?key, suppressed, "DNS-LATENCY: missed DNS request for response");
                    }
                    self.log(server, client, &message, None);
                }
                _ => {}
            }
        }
    }

    #[inline]
    pub(crate) fn held_len(&self) -> usize {
        self.held.len()
    }
}
