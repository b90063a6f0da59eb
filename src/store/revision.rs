/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Revision sequencing between the store and the dataplane.
//!
//! Changed names accumulate under the current revision. `HandleUpdates`
//! snapshots them and bumps the revision; `UpdatesApplied` marks everything
//! before the current revision as programmed and releases the callbacks that
//! were waiting on it.

use ahash::AHashSet;
use std::sync::mpsc::{Sender, channel};
use std::thread;
use tracing::{debug, warn};

/// Completion callback attached to a captured DNS packet.
pub type ReleaseCallback = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Where a packet's callback ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackPlacement {
    /// Waits for the next handle + applied cycle.
    Pending,
    /// Already handled; waits for the next applied.
    Handled,
    /// Already programmed; release now.
    Immediate,
}

pub(crate) struct RevisionSequencer {
    /// Next revision to be assigned. Starts at 1; 0 means "nothing to program".
    current_revision: u64,
    /// Highest revision programmed into the dataplane.
    applied_revision: u64,
    changed_names: AHashSet<String>,
    callbacks: Vec<ReleaseCallback>,
    handled_callbacks: Vec<ReleaseCallback>,
    /// Sticky across repeated handles until the next applied.
    needs_dataplane_sync: bool,
}

impl std::fmt::Debug for RevisionSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionSequencer")
            .field("current_revision", &self.current_revision)
            .field("applied_revision", &self.applied_revision)
            .field("changed_names", &self.changed_names.len())
            .field("callbacks", &self.callbacks.len())
            .field("handled_callbacks", &self.handled_callbacks.len())
            .finish()
    }
}

impl Default for RevisionSequencer {
    fn default() -> Self {
        Self {
            current_revision: 1,
            applied_revision: 0,
            changed_names: AHashSet::new(),
            callbacks: Vec::new(),
            handled_callbacks: Vec::new(),
            needs_dataplane_sync: false,
        }
    }
}

impl RevisionSequencer {
    #[inline]
    pub(crate) fn current_revision(&self) -> u64 {
        self.current_revision
    }

    #[inline]
    pub(crate) fn applied_revision(&self) -> u64 {
        self.applied_revision
    }

    #[inline]
    pub(crate) fn mark_changed(&mut self, name: &str) {
        if !self.changed_names.contains(name) {
            self.changed_names.insert(name.to_string());
        }
    }

    #[inline]
    pub(crate) fn has_changes(&self) -> bool {
        !self.changed_names.is_empty()
    }

    /// Queue (or hand back) the callback for a packet whose changes landed
    /// at `revision`.
    pub(crate) fn attach(
        &mut self,
        revision: u64,
        callback: ReleaseCallback,
    ) -> (CallbackPlacement, Option<ReleaseCallback>) {
        if revision >= self.current_revision {
            debug!(
                revision,
                current = self.current_revision,
                "changes not yet handled"
            );
            self.callbacks.push(callback);
            (CallbackPlacement::Pending, None)
        } else if revision <= self.applied_revision {
            debug!(
                revision,
                applied = self.applied_revision,
                "changes applied or not required"
            );
            (CallbackPlacement::Immediate, Some(callback))
        } else {
            debug!(
                revision,
                applied = self.applied_revision,
                "changes handled but not applied"
            );
            self.handled_callbacks.push(callback);
            (CallbackPlacement::Handled, None)
        }
    }

    /// First half of `HandleUpdates`: move pending callbacks to the handled
    /// queue, advance the revision and take the changed names.
    pub(crate) fn begin_handle(&mut self) -> AHashSet<String> {
        let pending = std::mem::take(&mut self.callbacks);
        self.handled_callbacks.extend(pending);
        self.current_revision += 1;
        std::mem::take(&mut self.changed_names)
    }

    pub(crate) fn set_needs_dataplane_sync(&mut self) {
        self.needs_dataplane_sync = true;
    }

    #[inline]
    pub(crate) fn needs_dataplane_sync(&self) -> bool {
        self.needs_dataplane_sync
    }

    /// `UpdatesApplied`: everything before the current revision is now
    /// programmed. Safe to call without a preceding handle.
    pub(crate) fn mark_applied(&mut self) -> Vec<ReleaseCallback> {
        self.needs_dataplane_sync = false;
        self.applied_revision = self.current_revision - 1;
        std::mem::take(&mut self.handled_callbacks)
    }
}

/// Runs release callbacks on a dedicated thread so neither the main loop nor
/// the dataplane caller ever waits on packet-source code.
#[derive(Debug)]
pub(crate) struct CallbackReleaser {
    tx: Sender<Vec<ReleaseCallback>>,
}

impl CallbackReleaser {
    pub(crate) fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = channel::<Vec<ReleaseCallback>>();
        thread::Builder::new()
            .name("dns-release".to_string())
            .spawn(move || {
                while let Ok(batch) = rx.recv() {
                    for callback in batch {
                        callback();
                    }
                }
            })?;
        Ok(Self { tx })
    }

    pub(crate) fn release(&self, callbacks: Vec<ReleaseCallback>) {
        if callbacks.is_empty() {
            return;
        }
        debug!(count = callbacks.len(), "invoking callbacks for DNS packets");
        if let Err(e) = self.tx.send(callbacks) {
            warn!("callback thread gone, releasing inline");
            for callback in e.0 {
                callback();
            }
        }
    }
}
