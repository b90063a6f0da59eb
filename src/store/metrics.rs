/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Packet counters for snooped DNS traffic

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PacketCounters {
    invalid: AtomicU64,
    non_query: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
}

/// Point-in-time copy of [`PacketCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub invalid: u64,
    pub non_query: u64,
    pub requests: u64,
    pub responses: u64,
}

impl PacketCounters {
    #[inline]
    pub fn inc_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_non_query(&self) {
        self.non_query.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_responses(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            invalid: self.invalid.load(Ordering::Relaxed),
            non_query: self.non_query.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
        }
    }
}
