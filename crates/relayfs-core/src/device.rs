// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The request device endpoint
//!
//! Exactly one daemon process holds the device open. Reads hand it one
//! fixed-size upcall record at a time; writes deliver one downcall each.
//! Neither ever blocks: the device reports "try again" and the daemon is
//! expected to poll. Control-plane requests travel out-of-band and never
//! touch the operation state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relayfs_proto::{
    check_trailer_law, encode_upcall, validate_header, OpType, RecordHeader, Response,
    DOWNCALL_FIXED_SIZE, HEADER_SIZE, MAX_DOWNCALL_SIZE, PROTO_MAGIC, PROTO_VERSION,
    UPCALL_RECORD_SIZE,
};

use crate::bulk::BulkMapping;
use crate::error::{DevError, DevResult};
use crate::operation::{OpKind, Operation, Tag};
use crate::session::Session;

/// The user-memory copy failed (the daemon passed a bad buffer).
#[derive(Debug)]
pub struct CopyFault;

/// Models the user-space buffer a device call copies to or from; either
/// direction can fault.
pub trait UserBuffer {
    fn len(&self) -> usize;
    fn copy_out(&mut self, src: &[u8]) -> Result<(), CopyFault>;
    fn copy_in(&self, dst: &mut [u8]) -> Result<(), CopyFault>;
}

/// Plain in-memory buffer.
pub struct SliceBuffer<'a> {
    data: &'a mut [u8],
}

impl<'a> SliceBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        SliceBuffer { data }
    }
}

impl UserBuffer for SliceBuffer<'_> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn copy_out(&mut self, src: &[u8]) -> Result<(), CopyFault> {
        if src.len() != self.data.len() {
            return Err(CopyFault);
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    fn copy_in(&self, dst: &mut [u8]) -> Result<(), CopyFault> {
        if dst.len() != self.data.len() {
            return Err(CopyFault);
        }
        dst.copy_from_slice(self.data);
        Ok(())
    }
}

/// Out-of-band control-plane requests (the ioctl surface).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    GetMagic,
    GetMaxUpSize,
    GetMaxDownSize,
    MapBulkBuffer(BulkMapping),
    /// Queue a remount operation for every filesystem marked pending.
    RemountAll,
    /// The modern daemon announces itself and its feature mask.
    ClientReady { features: u64 },
    SetDebugMask(u64),
    GetDebugMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlReply {
    Magic(u32),
    MaxUpSize(u32),
    MaxDownSize(u32),
    Mapped,
    RemountsQueued(u32),
    Ready,
    DebugMask(u64),
}

impl Session {
    /// Attach a daemon. Fails with Busy while another daemon holds the
    /// device, and rejects blocking-mode opens outright.
    pub fn open_device(self: &Arc<Self>, nonblocking: bool) -> DevResult<DaemonConn> {
        if !nonblocking {
            return Err(DevError::Invalid("device must be opened non-blocking"));
        }
        if self
            .client_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DevError::Busy);
        }
        tracing::info!("daemon attached to request device");
        Ok(DaemonConn { session: Arc::clone(self), released: AtomicBool::new(false) })
    }
}

/// The single daemon's connection to the request device. Dropping it (a
/// daemon crash) or releasing it runs the session purge sequence.
pub struct DaemonConn {
    session: Arc<Session>,
    released: AtomicBool,
}

impl DaemonConn {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Kernel -> daemon: copy out the next eligible upcall record.
    pub fn read_upcall(&self, buf: &mut dyn UserBuffer) -> DevResult<usize> {
        if buf.len() != UPCALL_RECORD_SIZE {
            return Err(DevError::Invalid("read buffer must hold exactly one upcall record"));
        }
        // Cheap fast path before any lock traffic.
        if self.session.queue.is_empty() {
            return Err(DevError::WouldBlock);
        }
        let Some(op) = self.session.queue.claim_next(self.session.mounts()) else {
            return Err(DevError::WouldBlock);
        };
        // Accounted in the in-flight table for the whole dispatch attempt:
        // an abandoning caller must always find it in one collection.
        self.session.inflight.insert(Arc::clone(&op));
        let mut record = [0u8; UPCALL_RECORD_SIZE];
        if let Err(err) = encode_upcall(PROTO_VERSION, op.tag().0, op.request(), &mut record) {
            tracing::error!(tag = %op.tag(), %err, "unserializable upcall, failing operation");
            self.session.inflight.discard(op.tag());
            op.resolve_failed(-libc::EINVAL);
            return Err(err.into());
        }
        if buf.copy_out(&record).is_err() {
            // The daemon's buffer went away mid-copy; the work is not lost,
            // it goes back to the head of the queue.
            tracing::warn!(tag = %op.tag(), "copy-out fault, re-queuing operation");
            if !self.session.queue.requeue_front(Arc::clone(&op)) {
                // Abandoned mid-claim; the daemon never saw it.
                if let OpKind::Cancel { slot } = op.kind() {
                    self.session.slots.release(slot);
                }
            }
            self.session.inflight.discard(op.tag());
            return Err(DevError::Fault);
        }
        tracing::trace!(tag = %op.tag(), op = %op.op_type(), "upcall dispatched");
        Ok(UPCALL_RECORD_SIZE)
    }

    /// Daemon -> kernel: consume one downcall and resolve the matching
    /// operation.
    pub fn write_downcall(&self, buf: &dyn UserBuffer) -> DevResult<usize> {
        let total = buf.len();
        if total < DOWNCALL_FIXED_SIZE {
            return Err(DevError::Invalid("downcall shorter than the fixed record"));
        }
        if total > MAX_DOWNCALL_SIZE {
            return Err(DevError::Invalid("downcall larger than the maximum record"));
        }
        let mut data = vec![0u8; total];
        buf.copy_in(&mut data).map_err(|_| DevError::Fault)?;

        let header = RecordHeader::decode(&data[..HEADER_SIZE])?;
        validate_header(&header)?;
        self.pin_version(header.version)?;

        let Some(op) =
            self.session.inflight.remove_matching(Tag(header.tag), self.session.slots.as_ref())
        else {
            // Stale or forged tag, or a caller that already gave up. The
            // write is consumed; nothing else moves.
            tracing::debug!(tag = header.tag, "downcall matched no in-flight operation");
            return Ok(total);
        };

        let (response, declared_trailer) =
            match Response::decode(&data[HEADER_SIZE..DOWNCALL_FIXED_SIZE]) {
                Ok(decoded) => decoded,
                Err(err) => {
                    // Already out of the table; mark failed rather than
                    // dropping the caller on the floor.
                    op.resolve_failed(-libc::EIO);
                    return Err(err.into());
                }
            };

        if response.op_type() != op.op_type() {
            tracing::warn!(
                tag = header.tag,
                got = %response.op_type(),
                want = %op.op_type(),
                "downcall operation type mismatch"
            );
            op.resolve_failed(-libc::EPROTO);
            return Ok(total);
        }

        if response.status < 0 {
            // Embedded failure: no trailer handling applies.
            self.finish(op, response, None);
            return Ok(total);
        }

        let actual_trailer = (total - DOWNCALL_FIXED_SIZE) as u64;
        if declared_trailer != actual_trailer
            || check_trailer_law(response.op_type(), declared_trailer).is_err()
        {
            tracing::warn!(
                tag = header.tag,
                declared = declared_trailer,
                actual = actual_trailer,
                "trailer mismatch, converting to I/O failure"
            );
            op.resolve_failed(-libc::EIO);
            return Ok(total);
        }

        let trailer = if actual_trailer > 0 {
            let mut bytes = Vec::new();
            if bytes.try_reserve_exact(actual_trailer as usize).is_err() {
                op.resolve_failed(-libc::ENOMEM);
                return Ok(total);
            }
            bytes.extend_from_slice(&data[DOWNCALL_FIXED_SIZE..]);
            Some(bytes)
        } else {
            None
        };

        self.finish(op, response, trailer);
        Ok(total)
    }

    /// Poll support: true once at least one operation is queued.
    pub fn poll_readable(&self, timeout: Duration) -> bool {
        self.session.queue.wait_readable(timeout)
    }

    pub fn control(&self, request: ControlRequest) -> DevResult<ControlReply> {
        match request {
            ControlRequest::GetMagic => Ok(ControlReply::Magic(PROTO_MAGIC)),
            ControlRequest::GetMaxUpSize => Ok(ControlReply::MaxUpSize(UPCALL_RECORD_SIZE as u32)),
            ControlRequest::GetMaxDownSize => {
                Ok(ControlReply::MaxDownSize(MAX_DOWNCALL_SIZE as u32))
            }
            ControlRequest::MapBulkBuffer(mapping) => {
                if !mapping.is_valid() {
                    return Err(DevError::Invalid("bulk buffer mapping descriptor"));
                }
                *self.session.bulk_map.lock().unwrap() = Some(mapping);
                tracing::info!(
                    slots = mapping.slot_count,
                    slot_size = mapping.slot_size,
                    "bulk buffer mapped"
                );
                Ok(ControlReply::Mapped)
            }
            ControlRequest::RemountAll => {
                let pending = self.session.mounts().pending_remounts();
                let count = pending.len() as u32;
                for (fs_id, config) in pending {
                    let request = relayfs_proto::Request {
                        fs_id,
                        body: relayfs_proto::RequestBody::FsMount { config },
                    };
                    let op = Arc::new(Operation::new(
                        self.session.alloc_tag(),
                        request,
                        OpKind::Internal,
                    ));
                    tracing::debug!(fs_id, tag = %op.tag(), "queuing remount");
                    self.session.queue.enqueue(op);
                }
                Ok(ControlReply::RemountsQueued(count))
            }
            ControlRequest::ClientReady { features } => {
                self.session.client_ready.store(true, Ordering::Release);
                tracing::info!(features, "daemon announced modern capability set");
                Ok(ControlReply::Ready)
            }
            ControlRequest::SetDebugMask(mask) => {
                self.session.debug_mask.store(mask, Ordering::Relaxed);
                Ok(ControlReply::DebugMask(mask))
            }
            ControlRequest::GetDebugMask => {
                Ok(ControlReply::DebugMask(self.session.debug_mask.load(Ordering::Relaxed)))
            }
        }
    }

    /// Orderly detach; same recovery path as a crash.
    pub fn release(self) {
        self.do_release();
    }

    fn pin_version(&self, version: u32) -> DevResult<()> {
        let mut pinned = self.session.pinned_version.lock().unwrap();
        match *pinned {
            None => {
                *pinned = Some(version);
                tracing::debug!(version, "session protocol version pinned");
                Ok(())
            }
            Some(current) if current != version => {
                Err(DevError::VersionChanged { pinned: current, got: version })
            }
            Some(_) => Ok(()),
        }
    }

    fn finish(&self, op: Arc<Operation>, response: Response, trailer: Option<Vec<u8>>) {
        if op.kind() == OpKind::Internal
            && op.op_type() == OpType::FsMount
            && response.status == 0
        {
            self.session.mounts().complete_remount(op.request().fs_id);
        }
        tracing::trace!(tag = %op.tag(), status = response.status, "downcall delivered");
        op.resolve_serviced(response, trailer);
    }

    fn do_release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.session.purge();
        }
    }
}

impl Drop for DaemonConn {
    fn drop(&mut self) {
        self.do_release();
    }
}
