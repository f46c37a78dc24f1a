// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the RelayFS protocol core

use relayfs_proto::WireError;

/// Device endpoint error, errno-flavored the way the daemon sees it.
#[derive(thiserror::Error, Debug)]
pub enum DevError {
    #[error("no work available, try again")]
    WouldBlock,
    #[error("user buffer not accessible")]
    Fault,
    #[error("device already in use")]
    Busy,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
    #[error("session protocol version changed from {pinned} to {got}")]
    VersionChanged { pinned: u32, got: u32 },
}

impl DevError {
    /// The errno the kernel-side device would surface for this error.
    pub fn errno(&self) -> i32 {
        match self {
            DevError::WouldBlock => libc::EAGAIN,
            DevError::Fault => libc::EFAULT,
            DevError::Busy => libc::EBUSY,
            DevError::Invalid(_) => libc::EINVAL,
            DevError::Protocol(_) | DevError::VersionChanged { .. } => libc::EPROTO,
        }
    }
}

/// Failure observed by an issuing caller.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum OpError {
    /// Session loss or caller abandonment; ETIMEDOUT-equivalent.
    #[error("operation timed out")]
    TimedOut,
    #[error("no daemon is servicing this session")]
    NoDaemon,
    /// Normalized failure code from the daemon (negative errno-style).
    #[error("operation failed with code {0}")]
    Failed(i32),
}

pub type DevResult<T> = Result<T, DevError>;
pub type OpResult<T> = Result<T, OpError>;
