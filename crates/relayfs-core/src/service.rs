// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The issuing-caller path: submit an operation and block for its result

use std::sync::Arc;
use std::time::Duration;

use relayfs_proto::{Request, RequestBody, Response, ResponseBody};

use crate::error::{OpError, OpResult};
use crate::operation::{OpKind, Operation, Tag, WaitOutcome};
use crate::session::Session;

/// Per-call knobs for [`Session::service_operation`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceOptions {
    /// Overrides the session's configured wait; `None` uses the config.
    pub timeout: Option<Duration>,
    /// Fail with [`OpError::NoDaemon`] instead of queuing when no daemon
    /// holds the device.
    pub fail_fast: bool,
}

impl Session {
    /// Dispatch one request to the daemon and block until it resolves.
    /// Returns the response and optional trailer, a normalized failure
    /// code, or a timeout-class error on session loss or abandonment.
    pub fn service_operation(
        &self,
        request: Request,
        opts: ServiceOptions,
    ) -> OpResult<(Response, Option<Vec<u8>>)> {
        if opts.fail_fast && !self.is_client_connected() {
            return Err(OpError::NoDaemon);
        }
        let op = Arc::new(Operation::new(self.alloc_tag(), request, OpKind::Caller));
        self.queue.enqueue(Arc::clone(&op));
        tracing::debug!(tag = %op.tag(), op = %op.op_type(), "operation queued");

        let timeout = opts.timeout.or_else(|| self.config.op_timeout());
        match op.wait_resolved(timeout) {
            WaitOutcome::Serviced => match op.take_result() {
                Ok((response, trailer)) => {
                    if response.status < 0 {
                        Err(OpError::Failed(response.status))
                    } else {
                        Ok((response, trailer))
                    }
                }
                Err(code) => Err(OpError::Failed(code)),
            },
            WaitOutcome::Purged => {
                tracing::debug!(tag = %op.tag(), "operation purged by session loss");
                Err(OpError::TimedOut)
            }
            WaitOutcome::GivenUp => {
                self.give_up(&op);
                Err(OpError::TimedOut)
            }
        }
    }

    /// Shorthand with default options.
    pub fn service_request(&self, request: Request) -> OpResult<(Response, Option<Vec<u8>>)> {
        self.service_operation(request, ServiceOptions::default())
    }

    /// Mount a filesystem: dispatches FsMount and records the mount so the
    /// remount filter knows about it.
    pub fn mount(&self, config: &str, opts: ServiceOptions) -> OpResult<(i32, u64)> {
        let request =
            Request { fs_id: -1, body: RequestBody::FsMount { config: config.to_string() } };
        let (response, _) = self.service_operation(request, opts)?;
        match response.body {
            ResponseBody::FsMount { fs_id, root_handle, .. } => {
                self.mounts().register(fs_id, config);
                tracing::info!(fs_id, "filesystem mounted");
                Ok((fs_id, root_handle))
            }
            _ => Err(OpError::Failed(-libc::EIO)),
        }
    }

    /// Unmount: dispatches FsUnmount and drops the mount record.
    pub fn unmount(&self, fs_id: i32, id: u64, opts: ServiceOptions) -> OpResult<()> {
        if !self.mounts().is_mounted(fs_id) {
            return Err(OpError::Failed(-libc::EINVAL));
        }
        let request = Request { fs_id, body: RequestBody::FsUnmount { id } };
        self.service_operation(request, opts)?;
        self.mounts().unregister(fs_id);
        tracing::info!(fs_id, "filesystem unmounted");
        Ok(())
    }

    /// Abandonment cleanup. The operation is already a GivenUp tombstone;
    /// remove it from the waiting queue if it never left, and if the daemon
    /// holds a bulk I/O slot for it, queue a self-releasing cancellation.
    fn give_up(&self, op: &Arc<Operation>) {
        if self.queue.discard(op.tag()) {
            tracing::debug!(tag = %op.tag(), "gave up before dispatch");
            return;
        }
        if self.inflight.contains(op.tag()) {
            tracing::debug!(tag = %op.tag(), "gave up while in progress");
            if let RequestBody::FileIo { slot, .. } = &op.request().body {
                self.submit_cancel(op.tag(), op.request().fs_id, *slot);
            }
        }
    }

    /// Queue a cancellation upcall for an abandoned in-flight operation.
    /// Nobody waits on it; the protocol layer releases the slot and frees
    /// it whenever it next touches it.
    pub fn submit_cancel(&self, target: Tag, fs_id: i32, slot: u32) {
        let request = Request { fs_id, body: RequestBody::Cancel { target_tag: target.0 } };
        let cancel =
            Arc::new(Operation::new(self.alloc_tag(), request, OpKind::Cancel { slot }));
        tracing::debug!(target = %target, slot, tag = %cancel.tag(), "cancellation queued");
        self.queue.enqueue(cancel);
    }
}
