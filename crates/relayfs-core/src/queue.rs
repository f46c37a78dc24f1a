// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The waiting queue: operations not yet handed to the daemon
//!
//! FIFO among eligible operations. The queue lock is always acquired before
//! any operation lock; the condvar backs the device's poll support.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use relayfs_proto::OpType;

use crate::bulk::SlotPool;
use crate::mounts::MountTable;
use crate::operation::{OpState, Operation, Tag};

/// Operation types that stay dispatchable while their filesystem is mid
/// remount, so the remount sequence itself can make progress.
fn eligible_during_remount(op_type: OpType) -> bool {
    matches!(op_type, OpType::FsMount | OpType::FsUnmount | OpType::Getattr)
}

#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    inner: Mutex<VecDeque<Arc<Operation>>>,
    readable: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fresh operation; transitions it Unknown -> Waiting.
    pub fn enqueue(&self, op: Arc<Operation>) {
        let mut inner = self.inner.lock().unwrap();
        if !op.set_state(OpState::Waiting) {
            // Resolved before it ever queued; nothing to dispatch.
            return;
        }
        inner.push_back(op);
        drop(inner);
        self.readable.notify_all();
    }

    /// Put a claimed operation back at the head after a failed delivery.
    /// Returns false when the operation went terminal in the meantime; the
    /// caller disposes of it instead of re-queuing a tombstone.
    pub fn requeue_front(&self, op: Arc<Operation>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !op.set_state(OpState::Waiting) {
            return false;
        }
        inner.push_front(op);
        drop(inner);
        self.readable.notify_all();
        true
    }

    /// Claim the first operation that is legal to dispatch right now and
    /// mark it InProgress. Tombstones are skipped in place; operations found
    /// in a state that should be impossible here are evicted and reported.
    pub fn claim_next(&self, mounts: &MountTable) -> Option<Arc<Operation>> {
        let mut inner = self.inner.lock().unwrap();
        let mut idx = 0;
        while idx < inner.len() {
            let op = &inner[idx];
            match op.state() {
                OpState::Waiting => {}
                OpState::Purged | OpState::GivenUp => {
                    idx += 1;
                    continue;
                }
                state @ (OpState::InProgress | OpState::Serviced | OpState::Unknown) => {
                    tracing::error!(
                        tag = %op.tag(),
                        ?state,
                        "operation on waiting queue in impossible state, evicting"
                    );
                    inner.remove(idx);
                    continue;
                }
            }
            if mounts.is_pending(op.request().fs_id) && !eligible_during_remount(op.op_type()) {
                idx += 1;
                continue;
            }
            if !inner[idx].set_state(OpState::InProgress) {
                // Went terminal between the state peek and the claim; leave
                // the tombstone for its owner to discard.
                idx += 1;
                continue;
            }
            let op = inner.remove(idx).unwrap();
            return Some(op);
        }
        None
    }

    /// Remove a tombstoned operation the issuing caller abandoned.
    pub fn discard(&self, tag: Tag) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.iter().position(|op| op.tag() == tag) {
            inner.remove(pos);
            true
        } else {
            false
        }
    }

    /// Session-loss step 2: resolve every queued operation as Purged;
    /// cancellations hand their slot back instead of waking anyone.
    pub fn purge_all(&self, slots: &dyn SlotPool) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain(..).collect()
        };
        let mut purged = 0;
        for op in drained {
            match op.kind() {
                crate::operation::OpKind::Cancel { slot } => {
                    slots.release(slot);
                }
                _ => op.resolve_purged(),
            }
            purged += 1;
        }
        purged
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Poll support: wait until something is queued or the timeout elapses.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        if !inner.is_empty() {
            return true;
        }
        let (inner, _) = self.readable.wait_timeout(inner, timeout).unwrap();
        !inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::NoopSlotPool;
    use crate::operation::{OpKind, WaitOutcome};
    use relayfs_proto::{Request, RequestBody};

    fn op(tag: u64, fs_id: i32, body: RequestBody) -> Arc<Operation> {
        Arc::new(Operation::new(Tag(tag), Request { fs_id, body }, OpKind::Caller))
    }

    fn lookup(tag: u64, fs_id: i32) -> Arc<Operation> {
        op(tag, fs_id, RequestBody::Lookup { parent: 1, name: format!("f{}", tag) })
    }

    #[test]
    fn test_fifo_claim_order() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        queue.enqueue(lookup(1, 1));
        queue.enqueue(lookup(2, 1));

        assert_eq!(queue.claim_next(&mounts).unwrap().tag(), Tag(1));
        assert_eq!(queue.claim_next(&mounts).unwrap().tag(), Tag(2));
        assert!(queue.claim_next(&mounts).is_none());
    }

    #[test]
    fn test_claim_marks_in_progress() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        queue.enqueue(lookup(1, 1));
        let claimed = queue.claim_next(&mounts).unwrap();
        assert_eq!(claimed.state(), OpState::InProgress);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remount_pending_filters_ordinary_ops() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        mounts.register(1, "server=alpha");
        mounts.mark_all_pending();

        queue.enqueue(lookup(1, 1));
        queue.enqueue(op(2, 1, RequestBody::Getattr { handle: 4, mask: 0 }));

        // The lookup is skipped in place; the attribute probe goes through.
        let claimed = queue.claim_next(&mounts).unwrap();
        assert_eq!(claimed.tag(), Tag(2));
        assert_eq!(queue.len(), 1);

        // Once the remount completes the lookup becomes eligible again.
        mounts.complete_remount(1);
        assert_eq!(queue.claim_next(&mounts).unwrap().tag(), Tag(1));
    }

    #[test]
    fn test_mount_ops_pass_remount_filter() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        mounts.register(1, "server=alpha");
        mounts.mark_all_pending();

        queue.enqueue(op(1, 1, RequestBody::FsMount { config: "server=alpha".to_string() }));
        assert_eq!(queue.claim_next(&mounts).unwrap().tag(), Tag(1));
    }

    #[test]
    fn test_tombstones_skipped_without_removal() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        let given_up = lookup(1, 1);
        queue.enqueue(Arc::clone(&given_up));
        given_up.wait_resolved(Some(Duration::from_millis(1)));
        queue.enqueue(lookup(2, 1));

        assert_eq!(queue.claim_next(&mounts).unwrap().tag(), Tag(2));
        // The tombstone stays queued until discarded or purged.
        assert_eq!(queue.len(), 1);
        assert!(queue.discard(Tag(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_impossible_state_evicted() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        let bad = lookup(1, 1);
        queue.enqueue(Arc::clone(&bad));
        // Simulate the bookkeeping defect the source logs: an op on the
        // waiting queue that already progressed.
        assert!(bad.set_state(OpState::InProgress));
        queue.enqueue(lookup(2, 1));

        assert_eq!(queue.claim_next(&mounts).unwrap().tag(), Tag(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_refused_for_tombstone() {
        let queue = WaitQueue::new();
        let mounts = MountTable::new();
        let op = lookup(1, 1);
        queue.enqueue(Arc::clone(&op));
        let claimed = queue.claim_next(&mounts).unwrap();

        // The caller abandons the claimed operation; a failed delivery must
        // not put the tombstone back on the queue.
        assert_eq!(op.wait_resolved(Some(Duration::from_millis(1))), WaitOutcome::GivenUp);
        assert!(!queue.requeue_front(claimed));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_refused_for_resolved_op() {
        let queue = WaitQueue::new();
        let op = lookup(1, 1);
        assert_eq!(op.wait_resolved(Some(Duration::from_millis(1))), WaitOutcome::GivenUp);
        queue.enqueue(op);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_purge_resolves_everything() {
        let queue = WaitQueue::new();
        queue.enqueue(lookup(1, 1));
        queue.enqueue(lookup(2, 1));

        let purged = queue.purge_all(&NoopSlotPool);
        assert_eq!(purged, 2);
        assert!(queue.is_empty());
        // Idempotent: nothing left to purge.
        assert_eq!(queue.purge_all(&NoopSlotPool), 0);
    }

    #[test]
    fn test_purge_releases_cancel_slots() {
        use crate::bulk::MockSlotPool;

        let queue = WaitQueue::new();
        let cancel = Arc::new(Operation::new(
            Tag(9),
            Request { fs_id: 1, body: RequestBody::Cancel { target_tag: 5 } },
            OpKind::Cancel { slot: 3 },
        ));
        queue.enqueue(cancel);

        let mut pool = MockSlotPool::new();
        pool.expect_release().withf(|slot| *slot == 3).times(1).return_const(());
        assert_eq!(queue.purge_all(&pool), 1);
    }
}
