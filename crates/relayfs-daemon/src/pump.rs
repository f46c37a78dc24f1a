// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The client-core pump: attach, handshake, then read-service-write
//!
//! One pump owns the device connection for its whole life. Attachment runs
//! the control-plane handshake (magic and size checks, bulk buffer mapping,
//! readiness announcement, remount recovery) before the first upcall is
//! read, so a replacement daemon restores interrupted mounts ahead of new
//! traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relayfs_core::{
    BulkMapping, ControlReply, ControlRequest, DaemonConn, DevError, Session, SliceBuffer,
};
use relayfs_proto::{
    decode_upcall, encode_downcall, WireError, MAX_DOWNCALL_SIZE, PROTO_MAGIC, PROTO_VERSION,
    UPCALL_RECORD_SIZE,
};

use crate::servicer::{UpcallHandler, SUPPORTED_FEATURES};

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("device error: {0}")]
    Device(#[from] DevError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
}

/// How long one poll cycle waits for work before rechecking shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ClientCore {
    conn: DaemonConn,
    handler: Box<dyn UpcallHandler>,
    shutdown: Arc<AtomicBool>,
}

impl ClientCore {
    /// Open the device and run the full attach handshake.
    pub fn attach(
        session: &Arc<Session>,
        handler: Box<dyn UpcallHandler>,
        bulk: BulkMapping,
    ) -> Result<Self, PumpError> {
        let conn = session.open_device(true)?;

        match conn.control(ControlRequest::GetMagic)? {
            ControlReply::Magic(PROTO_MAGIC) => {}
            _ => return Err(PumpError::Handshake("magic mismatch")),
        }
        match conn.control(ControlRequest::GetMaxUpSize)? {
            ControlReply::MaxUpSize(size) if size as usize == UPCALL_RECORD_SIZE => {}
            _ => return Err(PumpError::Handshake("upcall record size mismatch")),
        }
        match conn.control(ControlRequest::GetMaxDownSize)? {
            ControlReply::MaxDownSize(size) if size as usize == MAX_DOWNCALL_SIZE => {}
            _ => return Err(PumpError::Handshake("downcall record size mismatch")),
        }
        conn.control(ControlRequest::MapBulkBuffer(bulk))?;
        conn.control(ControlRequest::ClientReady { features: SUPPORTED_FEATURES })?;

        // Pick up mounts orphaned by a predecessor before serving anything.
        if let ControlReply::RemountsQueued(count) =
            conn.control(ControlRequest::RemountAll)?
        {
            if count > 0 {
                tracing::info!(count, "recovering mounts from previous session");
            }
        }

        Ok(ClientCore {
            conn,
            handler,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for asking the pump loop to stop from another thread.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Serve until shutdown is requested. Detaches cleanly on exit.
    pub fn run(mut self) -> Result<(), PumpError> {
        tracing::info!("client-core pump started");
        while !self.shutdown.load(Ordering::Acquire) {
            if !self.conn.poll_readable(POLL_INTERVAL) {
                continue;
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => {} // raced another wakeup; poll again
                Err(PumpError::Device(err @ DevError::Fault)) => {
                    tracing::error!(errno = err.errno(), "device copy fault, retrying");
                }
                Err(err) => {
                    if let PumpError::Device(dev) = &err {
                        tracing::error!(errno = dev.errno(), %err, "pump stopping on unrecoverable error");
                    } else {
                        tracing::error!(%err, "pump stopping on unrecoverable error");
                    }
                    self.conn.release();
                    return Err(err);
                }
            }
        }
        tracing::info!("client-core pump detaching");
        self.conn.release();
        Ok(())
    }

    /// One read-service-write cycle. Returns false when no work was ready.
    pub fn step(&mut self) -> Result<bool, PumpError> {
        let mut raw = vec![0u8; UPCALL_RECORD_SIZE];
        match self.conn.read_upcall(&mut SliceBuffer::new(&mut raw)) {
            Ok(_) => {}
            Err(DevError::WouldBlock) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        let (header, request) = decode_upcall(&raw)?;
        tracing::debug!(tag = header.tag, op = %request.op_type(), "servicing upcall");

        let (response, trailer) = self.handler.handle(&request);
        let mut bytes =
            encode_downcall(PROTO_VERSION, header.tag, &response, trailer.as_deref())?;
        self.conn.write_downcall(&SliceBuffer::new(&mut bytes))?;
        Ok(true)
    }
}
