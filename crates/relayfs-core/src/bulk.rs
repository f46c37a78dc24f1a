// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared bulk-buffer collaborators
//!
//! Large payloads never travel through the request device; they move through
//! a shared buffer the daemon maps once per session. The core only tracks
//! the mapping descriptor and returns abandoned slots to the pool — the
//! buffer's byte layout belongs to the I/O layer.

/// Descriptor for the daemon's shared bulk-buffer mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkMapping {
    pub total_size: u64,
    pub slot_count: u32,
    pub slot_size: u64,
}

impl BulkMapping {
    pub fn is_valid(&self) -> bool {
        self.slot_count > 0
            && self.slot_size > 0
            && u64::from(self.slot_count) * self.slot_size <= self.total_size
    }
}

/// Owner of the per-slot accounting for the shared buffer. The protocol
/// layer releases a slot when it disposes of a cancellation that named it.
#[cfg_attr(test, mockall::automock)]
pub trait SlotPool: Send + Sync {
    fn release(&self, slot: u32);
}

/// Pool used when no bulk buffer is mapped.
#[derive(Debug, Default)]
pub struct NoopSlotPool;

impl SlotPool for NoopSlotPool {
    fn release(&self, slot: u32) {
        tracing::debug!(slot, "released slot without a mapped bulk buffer");
    }
}
