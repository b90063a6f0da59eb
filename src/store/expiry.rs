/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Wall-clock expiry schedule for cached mappings.
//!
//! One min-heap replaces a timer per mapping, with one entry per live value.
//! Refreshing a mapping only moves its recorded expiry; when the old deadline
//! pops, the cache sees the later expiry and schedules the entry again.

use crate::store::ClientKey;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Identifies one cached `name -> value` mapping of one client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MappingKey {
    pub(crate) client: ClientKey,
    pub(crate) name: String,
    pub(crate) value: String,
}

#[derive(Debug, Default)]
pub(crate) struct ExpiryQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, MappingKey)>>,
}

impl ExpiryQueue {
    pub(crate) fn schedule(&mut self, at: DateTime<Utc>, key: MappingKey) {
        self.heap.push(Reverse((at, key)));
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every mapping whose deadline is at or before `now`.
    pub(crate) fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<MappingKey> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.heap.pop() {
                due.push(key);
            }
        }
        due
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
