// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RelayFS protocol core
//!
//! The kernel-side half of the RelayFS request/response protocol: issuing
//! callers queue operations, a single user-space client-core daemon pulls
//! them through the request device as fixed-size upcalls and answers them
//! as tagged downcalls, and a session guard recovers every piece of
//! outstanding work when the daemon goes away.

pub mod bulk;
pub mod config;
pub mod device;
pub mod error;
pub mod mounts;
pub mod operation;
pub mod service;
pub mod session;

mod inflight;
mod queue;

pub use bulk::{BulkMapping, NoopSlotPool, SlotPool};
pub use config::ProtocolConfig;
pub use device::{
    ControlReply, ControlRequest, CopyFault, DaemonConn, SliceBuffer, UserBuffer,
};
pub use error::{DevError, DevResult, OpError, OpResult};
pub use mounts::MountTable;
pub use operation::{OpKind, OpState, Operation, Tag, WaitOutcome};
pub use service::ServiceOptions;
pub use session::Session;
