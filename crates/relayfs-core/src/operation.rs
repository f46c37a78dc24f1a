// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operations and their state machine
//!
//! An [`Operation`] pairs one upcall request with the slot its downcall
//! response lands in, correlated by a session-unique tag. The waiting queue
//! and the in-flight table hold shared references; the issuing caller owns
//! the operation and is the only party that destroys it, except for
//! cancellations and session-internal operations, which self-release.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use relayfs_proto::{OpType, Request, Response};

/// Correlation tag linking an upcall to its downcall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive operation state. The source kept these as OR-able bits; here
/// every operation is in exactly one state at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    Unknown,
    Waiting,
    InProgress,
    Serviced,
    Purged,
    GivenUp,
}

impl OpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Serviced | OpState::Purged | OpState::GivenUp)
    }
}

/// Who is responsible for an operation once it resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// A blocked issuing caller owns it and must be woken.
    Caller,
    /// Cancellation marker for an abandoned bulk I/O; the named slot is
    /// released when the protocol layer disposes of it.
    Cancel { slot: u32 },
    /// Session-owned (remount) operation; nobody waits on it.
    Internal,
}

/// Outcome observed by the issuing caller after blocking on the waiter.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Serviced,
    Purged,
    /// The wait timed out; the operation is now a GivenUp tombstone.
    GivenUp,
}

#[derive(Debug)]
struct OpInner {
    state: OpState,
    /// Written exactly once, by the device write path.
    response: Option<Response>,
    trailer: Option<Vec<u8>>,
    /// Local failure (protocol damage, allocation failure) recorded when no
    /// usable response exists.
    failure: Option<i32>,
}

/// One unit of protocol work.
#[derive(Debug)]
pub struct Operation {
    tag: Tag,
    kind: OpKind,
    request: Request,
    inner: Mutex<OpInner>,
    done: Condvar,
}

impl Operation {
    pub fn new(tag: Tag, request: Request, kind: OpKind) -> Self {
        Operation {
            tag,
            kind,
            request,
            inner: Mutex::new(OpInner {
                state: OpState::Unknown,
                response: None,
                trailer: None,
                failure: None,
            }),
            done: Condvar::new(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn op_type(&self) -> OpType {
        self.request.op_type()
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self.kind, OpKind::Cancel { .. })
    }

    pub fn state(&self) -> OpState {
        self.inner.lock().unwrap().state
    }

    /// Non-terminal transition (Waiting/InProgress shuffling by the device
    /// read path). Refused once the operation is terminal: a caller timeout
    /// can tombstone it between a queue peek and the claim, and the
    /// tombstone must not be resurrected. Collection locks are held by the
    /// caller as required.
    #[must_use]
    pub(crate) fn set_state(&self, state: OpState) -> bool {
        debug_assert!(!state.is_terminal());
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = state;
        true
    }

    /// Deliver the downcall and wake the waiter.
    pub(crate) fn resolve_serviced(&self, response: Response, trailer: Option<Vec<u8>>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = OpState::Serviced;
        inner.response = Some(response);
        inner.trailer = trailer;
        drop(inner);
        self.done.notify_all();
    }

    /// Record a local failure (no usable response) and wake the waiter.
    pub(crate) fn resolve_failed(&self, code: i32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = OpState::Serviced;
        inner.failure = Some(code);
        drop(inner);
        self.done.notify_all();
    }

    /// Forced resolution at session teardown.
    pub(crate) fn resolve_purged(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = OpState::Purged;
        drop(inner);
        self.done.notify_all();
    }

    /// Block until the operation reaches a terminal state. On timeout the
    /// operation is tombstoned GivenUp in place; a response that races in
    /// after that is discarded by whoever touches the tombstone next.
    pub fn wait_resolved(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.state {
                OpState::Serviced => return WaitOutcome::Serviced,
                OpState::Purged => return WaitOutcome::Purged,
                OpState::GivenUp => return WaitOutcome::GivenUp,
                _ => {}
            }
            match deadline {
                None => inner = self.done.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        inner.state = OpState::GivenUp;
                        return WaitOutcome::GivenUp;
                    }
                    let (guard, _) = self.done.wait_timeout(inner, deadline - now).unwrap();
                    inner = guard;
                }
            }
        }
    }

    /// Take the serviced result: `Ok((response, trailer))` or the recorded
    /// failure code.
    pub fn take_result(&self) -> Result<(Response, Option<Vec<u8>>), i32> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(code) = inner.failure {
            return Err(code);
        }
        match inner.response.take() {
            Some(response) => {
                let trailer = inner.trailer.take();
                Ok((response, trailer))
            }
            None => Err(-libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayfs_proto::{RequestBody, ResponseBody};
    use std::sync::Arc;
    use std::thread;

    fn getattr_op(tag: u64) -> Operation {
        let request =
            Request { fs_id: 1, body: RequestBody::Getattr { handle: 100, mask: u32::MAX } };
        Operation::new(Tag(tag), request, OpKind::Caller)
    }

    #[test]
    fn test_new_operation_starts_unknown() {
        let op = getattr_op(1);
        assert_eq!(op.state(), OpState::Unknown);
        assert!(!op.is_cancel());
    }

    #[test]
    fn test_resolve_serviced_wakes_waiter() {
        let op = Arc::new(getattr_op(2));
        let waiter = Arc::clone(&op);
        let handle = thread::spawn(move || waiter.wait_resolved(Some(Duration::from_secs(5))));
        let response = Response {
            status: 0,
            body: ResponseBody::Getattr { attrs: Default::default(), link_target: None },
        };
        op.resolve_serviced(response, None);
        assert_eq!(handle.join().unwrap(), WaitOutcome::Serviced);
        assert!(op.take_result().is_ok());
    }

    #[test]
    fn test_wait_timeout_marks_given_up() {
        let op = getattr_op(3);
        let outcome = op.wait_resolved(Some(Duration::from_millis(10)));
        assert_eq!(outcome, WaitOutcome::GivenUp);
        assert_eq!(op.state(), OpState::GivenUp);
    }

    #[test]
    fn test_tombstone_refuses_state_transitions() {
        let op = getattr_op(7);
        assert_eq!(op.wait_resolved(Some(Duration::from_millis(1))), WaitOutcome::GivenUp);
        // A racing dispatcher cannot resurrect the tombstone.
        assert!(!op.set_state(OpState::InProgress));
        assert!(!op.set_state(OpState::Waiting));
        assert_eq!(op.state(), OpState::GivenUp);
    }

    #[test]
    fn test_late_response_does_not_overwrite_tombstone() {
        let op = getattr_op(4);
        op.wait_resolved(Some(Duration::from_millis(1)));
        let response = Response { status: 0, body: ResponseBody::Fsync };
        op.resolve_serviced(response, None);
        assert_eq!(op.state(), OpState::GivenUp);
    }

    #[test]
    fn test_purge_wakes_waiter() {
        let op = Arc::new(getattr_op(5));
        let waiter = Arc::clone(&op);
        let handle = thread::spawn(move || waiter.wait_resolved(Some(Duration::from_secs(5))));
        op.resolve_purged();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Purged);
    }

    #[test]
    fn test_failure_code_surfaces_through_take_result() {
        let op = getattr_op(6);
        op.resolve_failed(-libc::EIO);
        assert_eq!(op.state(), OpState::Serviced);
        assert_eq!(op.take_result().unwrap_err(), -libc::EIO);
    }
}
