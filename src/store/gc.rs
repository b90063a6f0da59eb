/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::store::cache::StoreState;
use ahash::AHashSet;
use tracing::debug;

impl StoreState {
    /// Delete name entries that neither hold a value nor are the target of
    /// a kept CNAME. Does nothing unless a mapping was removed since the last
    /// pass. Returns how many entries were deleted.
    pub(crate) fn collect_garbage(&mut self) -> usize {
        if !self.gc_trigger {
            return 0;
        }

        let mut deleted = 0;
        for lookup in self.clients.values_mut() {
            let mut keep = AHashSet::new();
            for (name, entry) in &lookup.mappings {
                if entry.values.is_empty() {
                    continue;
                }
                keep.insert(name.clone());
                for (value, value_entry) in &entry.values {
                    if !value_entry.is_name {
                        continue;
                    }
                    if !lookup.mappings.contains_key(value) {
                        panic!("missing mapping for {value}, which is a CNAME value of {name}");
                    }
                    keep.insert(value.clone());
                }
            }

            let before = lookup.mappings.len();
            lookup.mappings.retain(|name, _| keep.contains(name));
            deleted += before - lookup.mappings.len();
        }

        self.gc_trigger = false;
        debug!(
            deleted,
            remaining = self.mapping_count(),
            wildcards = self.wildcards.len(),
            scheduled = self.expiry.len(),
            "garbage collected name entries"
        );
        deleted
    }
}
