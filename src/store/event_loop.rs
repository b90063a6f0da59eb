/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::store::decode::{Decoded, DropReason, decode_packet};
use crate::store::latency::{LatencyCorrelator, SWEEP_INTERVAL};
use crate::store::{DnsPacket, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, info};

/// Upper bound on one idle wait when nothing is scheduled to expire.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Receivers and loop-owned state, created with the store and moved into
/// the loop when it starts.
pub(crate) struct LoopParts {
    pub(crate) msg_rx: mpsc::Receiver<DnsPacket>,
    pub(crate) reset_rx: mpsc::Receiver<()>,
    pub(crate) correlator: LatencyCorrelator,
}

pub(crate) struct MainLoop {
    shared: Arc<Shared>,
    parts: LoopParts,
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl MainLoop {
    pub(crate) fn new(shared: Arc<Shared>, parts: LoopParts) -> Self {
        Self { shared, parts }
    }

    pub(crate) async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut save_tick = ticker(self.shared.settings.save_interval);
        let mut gc_tick = ticker(self.shared.settings.gc_interval);
        let mut latency_tick = ticker(SWEEP_INTERVAL);
        info!(
            logs_latency = self.parts.correlator.measuring(),
            "Domain info store loop started"
        );

        loop {
            let expiry_wait = self.shared.next_expiry().map(|at| {
                (at - self.shared.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping domain info store");
                    break;
                }
                packet = self.parts.msg_rx.recv() => match packet {
                    Some(packet) => self.process_packet(packet).await,
                    None => break,
                },
                _ = sleep(expiry_wait.unwrap_or(IDLE_WAIT)), if expiry_wait.is_some() => {
                    self.shared.process_expiries();
                }
                _ = save_tick.tick() => self.shared.save_logged(),
                _ = gc_tick.tick() => {
                    let deleted = self.shared.collect_garbage();
                    debug!(
                        deleted,
                        held = self.parts.correlator.held_len(),
                        counters = ?self.shared.counters.snapshot(),
                        "GC tick"
                    );
                }
                _ = latency_tick.tick() => {
                    let now_ms = self.shared.now().timestamp_millis();
                    self.parts.correlator.sweep(now_ms);
                }
                Some(()) = self.parts.reset_rx.recv() => self.shared.expire_all(),
            }
        }

        self.shared.save_logged();
        info!("Domain info store stopped");
    }

    async fn process_packet(&mut self, packet: DnsPacket) {
        let DnsPacket {
            data,
            timestamp,
            callback,
        } = packet;
        let counters = &self.shared.counters;

        match decode_packet(&data) {
            Decoded::Dropped(reason) => {
                if reason == DropReason::NonQuery {
                    counters.inc_non_query();
                } else {
                    counters.inc_invalid();
                }
                self.shared.release_now(callback);
            }
            Decoded::Request(info) => {
                let now_ms = self.shared.now().timestamp_millis();
                self.parts.correlator.on_request(&info, timestamp, now_ms);
                counters.inc_requests();
                self.shared.release_now(callback);
            }
            Decoded::Response(info) => {
                let client = self.shared.client_key(info.dst);
                let revision = self.shared.store_response_records(&client, &info.message);

                let delay = self.shared.settings.response_delay;
                if !delay.is_zero() && self.shared.has_pending_changes() {
                    debug!(?delay, "Delaying DNS response");
                    sleep(delay).await;
                }
                self.shared.maybe_signal_updates_ready("mapping added");
                if let Some(callback) = callback {
                    self.shared.attach_callback(revision, callback);
                }

                let now_ms = self.shared.now().timestamp_millis();
                self.parts.correlator.on_response(&info, timestamp, now_ms);
                counters.inc_responses();
            }
        }
    }
}
