// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RelayFS Protocol — wire records exchanged over the request device
//!
//! This crate defines the fixed-size, byte-stable upcall and downcall
//! records the kernel-side client and the user-space client-core daemon
//! exchange, plus the validation rules for them.

pub mod records;
pub mod validation;

pub use records::{
    decode_upcall,
    encode_downcall,
    encode_upcall,
    DirentPage,
    ObjectAttrs,
    OpType,
    RecordHeader,
    Request,
    RequestBody,
    Response,
    ResponseBody,
    StatfsData,
    WireDirent,
    ATTR_ATIME,
    ATTR_CTIME,
    ATTR_GID,
    ATTR_MODE,
    ATTR_MTIME,
    ATTR_SIZE,
    ATTR_UID,
    DOWNCALL_FIXED_SIZE,
    HEADER_SIZE,
    LISTXATTR_MAX_KEYS,
    MAX_DOWNCALL_SIZE,
    MAX_TRAILER_SIZE,
    NAME_MAX,
    OBJ_DIR,
    OBJ_FILE,
    OBJ_SYMLINK,
    PROTO_MAGIC,
    PROTO_VERSION,
    PROTO_VERSION_MIN,
    REQUEST_UNION_SIZE,
    RESPONSE_UNION_SIZE,
    TARGET_MAX,
    UPCALL_RECORD_SIZE,
    XATTR_NAME_MAX,
    XATTR_VALUE_MAX,
};
pub use validation::*;
