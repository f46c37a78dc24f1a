// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The protocol session: one object owning every piece of shared state
//!
//! The source kept the waiting queue, the tag table, and the
//! "is a daemon attached" flag as module-level globals; here they are all
//! fields of [`Session`], constructed at service start and dropped at
//! service stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bulk::{BulkMapping, NoopSlotPool, SlotPool};
use crate::config::ProtocolConfig;
use crate::inflight::InflightTable;
use crate::mounts::MountTable;
use crate::operation::Tag;
use crate::queue::WaitQueue;

pub struct Session {
    pub(crate) config: ProtocolConfig,
    pub(crate) queue: WaitQueue,
    pub(crate) inflight: InflightTable,
    mounts: MountTable,
    pub(crate) slots: Arc<dyn SlotPool>,
    next_tag: AtomicU64,
    pub(crate) client_attached: AtomicBool,
    pub(crate) client_ready: AtomicBool,
    /// First downcall of a daemon session pins the version it speaks.
    pub(crate) pinned_version: Mutex<Option<u32>>,
    pub(crate) bulk_map: Mutex<Option<BulkMapping>>,
    pub(crate) debug_mask: AtomicU64,
}

impl Session {
    pub fn new(config: ProtocolConfig) -> Arc<Self> {
        Self::with_slot_pool(config, Arc::new(NoopSlotPool))
    }

    pub fn with_slot_pool(config: ProtocolConfig, slots: Arc<dyn SlotPool>) -> Arc<Self> {
        let debug_mask = config.debug_mask;
        Arc::new(Session {
            config,
            queue: WaitQueue::new(),
            inflight: InflightTable::new(),
            mounts: MountTable::new(),
            slots,
            next_tag: AtomicU64::new(1),
            client_attached: AtomicBool::new(false),
            client_ready: AtomicBool::new(false),
            pinned_version: Mutex::new(None),
            bulk_map: Mutex::new(None),
            debug_mask: AtomicU64::new(debug_mask),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Tags are never reused while this session lives.
    pub(crate) fn alloc_tag(&self) -> Tag {
        Tag(self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    /// Availability signal: exactly one daemon holds the device open.
    /// Service-layer callers use this to fail fast instead of queuing work
    /// that can never be served.
    pub fn is_client_connected(&self) -> bool {
        self.client_attached.load(Ordering::Acquire)
    }

    /// Whether the attached daemon announced the modern capability set.
    pub fn is_client_ready(&self) -> bool {
        self.client_ready.load(Ordering::Acquire)
    }

    pub fn waiting_len(&self) -> usize {
        self.queue.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Crash-recovery sequence, run when the daemon connection drops.
    /// Safe to run repeatedly; a second pass finds nothing to resolve.
    pub(crate) fn purge(&self) {
        let remounts = self.mounts.mark_all_pending();
        let waiting = self.queue.purge_all(self.slots.as_ref());
        let inflight = self.inflight.purge_all(self.slots.as_ref());
        *self.bulk_map.lock().unwrap() = None;
        *self.pinned_version.lock().unwrap() = None;
        self.client_ready.store(false, Ordering::Release);
        self.client_attached.store(false, Ordering::Release);
        tracing::info!(remounts, waiting, inflight, "daemon session closed, outstanding work purged");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("waiting", &self.queue.len())
            .field("inflight", &self.inflight.len())
            .field("client_attached", &self.is_client_connected())
            .finish()
    }
}
