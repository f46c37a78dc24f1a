// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Validation rules for RelayFS wire records

use thiserror::Error;

use crate::records::{OpType, RecordHeader, MAX_TRAILER_SIZE, PROTO_MAGIC, PROTO_VERSION_MIN};

/// Wire-level decoding/validation error
#[derive(Error, Debug)]
pub enum WireError {
    #[error("record truncated")]
    Truncated,
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {got} (minimum {min})")]
    BadVersion { got: u32, min: u32 },
    #[error("unknown operation type {0}")]
    UnknownOp(u32),
    #[error("field too large: {0}")]
    Oversize(&'static str),
    #[error("trailer size {size} not allowed for {op}")]
    TrailerMismatch { op: OpType, size: u64 },
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

impl From<std::io::Error> for WireError {
    fn from(_: std::io::Error) -> Self {
        WireError::Truncated
    }
}

/// Check magic and version floor on a record header. Session version
/// pinning is enforced by the device, not here.
pub fn validate_header(header: &RecordHeader) -> Result<(), WireError> {
    if header.magic != PROTO_MAGIC {
        return Err(WireError::BadMagic(header.magic));
    }
    if header.version < PROTO_VERSION_MIN {
        return Err(WireError::BadVersion { got: header.version, min: PROTO_VERSION_MIN });
    }
    Ok(())
}

/// Trailer law: a trailer is present if and only if the operation type
/// requires one, and never beyond the fixed bound.
pub fn check_trailer_law(op: OpType, trailer_size: u64) -> Result<(), WireError> {
    if trailer_size > MAX_TRAILER_SIZE as u64 {
        return Err(WireError::Oversize("trailer"));
    }
    let wants_trailer = op.requires_trailer();
    if wants_trailer != (trailer_size > 0) {
        return Err(WireError::TrailerMismatch { op, size: trailer_size });
    }
    Ok(())
}
