// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The in-flight table: operations the daemon currently holds
//!
//! Keyed by tag so a downcall, arriving in any order, can find the one
//! operation it answers. The table lock is always acquired before any
//! operation lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bulk::SlotPool;
use crate::operation::{OpKind, OpState, Operation, Tag};

#[derive(Debug, Default)]
pub(crate) struct InflightTable {
    inner: Mutex<HashMap<Tag, Arc<Operation>>>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once, right after the read path delivers the upcall.
    pub fn insert(&self, op: Arc<Operation>) {
        let mut inner = self.inner.lock().unwrap();
        let prev = inner.insert(op.tag(), op);
        debug_assert!(prev.is_none(), "tag reused while previous operation still in flight");
    }

    /// Remove and return the live operation a downcall with this tag
    /// answers. Absent, purged, or given-up tags yield `None`: the caller
    /// already abandoned the operation (or the tag is stale/forged) and the
    /// write is consumed without further effect. Cancellation markers hand
    /// their slot back to the pool and self-release here.
    pub fn remove_matching(&self, tag: Tag, slots: &dyn SlotPool) -> Option<Arc<Operation>> {
        let mut inner = self.inner.lock().unwrap();
        let op = inner.get(&tag)?;
        match op.state() {
            OpState::GivenUp | OpState::Purged => {
                // Tombstone: the entry is dead weight, drop it on the way out.
                let op = inner.remove(&tag).unwrap();
                tracing::debug!(tag = %op.tag(), "discarding downcall for abandoned operation");
                None
            }
            _ => {
                let op = inner.remove(&tag).unwrap();
                if let OpKind::Cancel { slot } = op.kind() {
                    drop(inner);
                    slots.release(slot);
                    tracing::debug!(tag = %tag, slot, "cancellation acknowledged, slot released");
                    return None;
                }
                Some(op)
            }
        }
    }

    /// Take an entry back out without resolving it (failed dispatch: the
    /// daemon never actually received the upcall).
    pub fn discard(&self, tag: Tag) -> Option<Arc<Operation>> {
        self.inner.lock().unwrap().remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.inner.lock().unwrap().contains_key(&tag)
    }

    /// Session-loss step 3: resolve every in-flight operation as Purged;
    /// cancellations hand their slot back instead of waking anyone.
    pub fn purge_all(&self, slots: &dyn SlotPool) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain().map(|(_, op)| op).collect()
        };
        let mut purged = 0;
        for op in drained {
            match op.kind() {
                OpKind::Cancel { slot } => slots.release(slot),
                _ => op.resolve_purged(),
            }
            purged += 1;
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
