// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed-layout wire records for the RelayFS request device
//!
//! Every upcall the daemon reads is exactly [`UPCALL_RECORD_SIZE`] bytes:
//! a 16-byte header followed by the request union. Every downcall it writes
//! starts with the same header shape, followed by the response union and an
//! optional trailer whose length is declared inside the response. All
//! integers are little-endian; unused union bytes are zero.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::validation::WireError;

/// Magic constant carried by every record in both directions.
pub const PROTO_MAGIC: u32 = 0x524c_4653;

/// Protocol version spoken by this build.
pub const PROTO_VERSION: u32 = 20_004;

/// Oldest daemon protocol version the device still accepts.
pub const PROTO_VERSION_MIN: u32 = 20_001;

/// Header layout: `version:u32, magic:u32, tag:u64`.
pub const HEADER_SIZE: usize = 16;

/// Fixed byte size of the request union (op type + fs id + body).
pub const REQUEST_UNION_SIZE: usize = 512;

/// Fixed byte size of the response union (op type + status + trailer size + body).
pub const RESPONSE_UNION_SIZE: usize = 512;

/// Size of one complete upcall record.
pub const UPCALL_RECORD_SIZE: usize = HEADER_SIZE + REQUEST_UNION_SIZE;

/// Minimum size of a downcall write (header + response union, no trailer).
pub const DOWNCALL_FIXED_SIZE: usize = HEADER_SIZE + RESPONSE_UNION_SIZE;

/// Upper bound on the variable-length readdir trailer.
pub const MAX_TRAILER_SIZE: usize = 64 * 1024;

/// Largest downcall write the device accepts.
pub const MAX_DOWNCALL_SIZE: usize = DOWNCALL_FIXED_SIZE + MAX_TRAILER_SIZE;

/// Longest directory-entry name carried inline in a request.
pub const NAME_MAX: usize = 128;

/// Longest symlink target / mount config string carried inline.
pub const TARGET_MAX: usize = 256;

/// Longest extended-attribute key.
pub const XATTR_NAME_MAX: usize = 64;

/// Longest extended-attribute value carried inline.
pub const XATTR_VALUE_MAX: usize = 128;

/// Most xattr keys one ListXattr downcall returns inline.
pub const LISTXATTR_MAX_KEYS: usize = 6;

// Setattr valid-mask bits.
pub const ATTR_MODE: u32 = 1 << 0;
pub const ATTR_UID: u32 = 1 << 1;
pub const ATTR_GID: u32 = 1 << 2;
pub const ATTR_SIZE: u32 = 1 << 3;
pub const ATTR_ATIME: u32 = 1 << 4;
pub const ATTR_MTIME: u32 = 1 << 5;
pub const ATTR_CTIME: u32 = 1 << 6;

// Object type codes carried in [`ObjectAttrs::objtype`] and dirents.
pub const OBJ_FILE: u32 = 1;
pub const OBJ_DIR: u32 = 2;
pub const OBJ_SYMLINK: u32 = 3;

/// Operation types carried in the request/response unions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    Lookup,
    Create,
    Mkdir,
    Symlink,
    FileIo,
    Getattr,
    Setattr,
    Remove,
    Rename,
    Statfs,
    Fsync,
    Readdir,
    GetXattr,
    SetXattr,
    ListXattr,
    RemoveXattr,
    FsMount,
    FsUnmount,
    Features,
    Cancel,
}

impl OpType {
    pub fn as_u32(self) -> u32 {
        match self {
            OpType::Lookup => 1,
            OpType::Create => 2,
            OpType::Mkdir => 3,
            OpType::Symlink => 4,
            OpType::FileIo => 5,
            OpType::Getattr => 6,
            OpType::Setattr => 7,
            OpType::Remove => 8,
            OpType::Rename => 9,
            OpType::Statfs => 10,
            OpType::Fsync => 11,
            OpType::Readdir => 12,
            OpType::GetXattr => 13,
            OpType::SetXattr => 14,
            OpType::ListXattr => 15,
            OpType::RemoveXattr => 16,
            OpType::FsMount => 17,
            OpType::FsUnmount => 18,
            OpType::Features => 19,
            OpType::Cancel => 20,
        }
    }

    pub fn from_u32(raw: u32) -> Result<Self, WireError> {
        Ok(match raw {
            1 => OpType::Lookup,
            2 => OpType::Create,
            3 => OpType::Mkdir,
            4 => OpType::Symlink,
            5 => OpType::FileIo,
            6 => OpType::Getattr,
            7 => OpType::Setattr,
            8 => OpType::Remove,
            9 => OpType::Rename,
            10 => OpType::Statfs,
            11 => OpType::Fsync,
            12 => OpType::Readdir,
            13 => OpType::GetXattr,
            14 => OpType::SetXattr,
            15 => OpType::ListXattr,
            16 => OpType::RemoveXattr,
            17 => OpType::FsMount,
            18 => OpType::FsUnmount,
            19 => OpType::Features,
            20 => OpType::Cancel,
            other => return Err(WireError::UnknownOp(other)),
        })
    }

    /// Readdir is the only operation whose downcall carries a trailer.
    pub fn requires_trailer(self) -> bool {
        matches!(self, OpType::Readdir)
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Common record header for both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u32,
    pub magic: u32,
    pub tag: u64,
}

impl RecordHeader {
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        let mut cur = Cursor::new(buf);
        cur.write_u32::<LittleEndian>(self.version)?;
        cur.write_u32::<LittleEndian>(self.magic)?;
        cur.write_u64::<LittleEndian>(self.tag)?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        Ok(RecordHeader {
            version: cur.read_u32::<LittleEndian>()?,
            magic: cur.read_u32::<LittleEndian>()?,
            tag: cur.read_u64::<LittleEndian>()?,
        })
    }
}

/// Plain object attributes, 48 bytes on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub nlink: u32,
    /// 1 = file, 2 = directory, 3 = symlink.
    pub objtype: u32,
}

impl ObjectAttrs {
    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> Result<(), WireError> {
        cur.write_u32::<LittleEndian>(self.mode)?;
        cur.write_u32::<LittleEndian>(self.uid)?;
        cur.write_u32::<LittleEndian>(self.gid)?;
        cur.write_u64::<LittleEndian>(self.size)?;
        cur.write_i64::<LittleEndian>(self.atime)?;
        cur.write_i64::<LittleEndian>(self.mtime)?;
        cur.write_i64::<LittleEndian>(self.ctime)?;
        cur.write_u32::<LittleEndian>(self.nlink)?;
        cur.write_u32::<LittleEndian>(self.objtype)?;
        Ok(())
    }

    fn read_from(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        Ok(ObjectAttrs {
            mode: cur.read_u32::<LittleEndian>()?,
            uid: cur.read_u32::<LittleEndian>()?,
            gid: cur.read_u32::<LittleEndian>()?,
            size: cur.read_u64::<LittleEndian>()?,
            atime: cur.read_i64::<LittleEndian>()?,
            mtime: cur.read_i64::<LittleEndian>()?,
            ctime: cur.read_i64::<LittleEndian>()?,
            nlink: cur.read_u32::<LittleEndian>()?,
            objtype: cur.read_u32::<LittleEndian>()?,
        })
    }
}

/// Filesystem statistics returned by Statfs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatfsData {
    pub block_size: u64,
    pub blocks_total: u64,
    pub blocks_avail: u64,
    pub files_total: u64,
    pub files_avail: u64,
}

/// One request as dispatched through the device.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Target filesystem id; -1 for the initial FsMount.
    pub fs_id: i32,
    pub body: RequestBody,
}

/// Per-operation request payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Lookup { parent: u64, name: String },
    Create { parent: u64, name: String, mode: u32 },
    Mkdir { parent: u64, name: String, mode: u32 },
    Symlink { parent: u64, name: String, target: String },
    /// Bulk data moves through the shared buffer; the request only names
    /// the slot. `write` is false for reads.
    FileIo { handle: u64, write: bool, slot: u32, offset: i64, size: u64 },
    Getattr { handle: u64, mask: u32 },
    Setattr { handle: u64, attrs: ObjectAttrs, valid: u32 },
    Remove { parent: u64, name: String },
    Rename { old_parent: u64, new_parent: u64, old_name: String, new_name: String },
    Statfs,
    Fsync { handle: u64 },
    Readdir { handle: u64, token: u64, max_entries: u32 },
    GetXattr { handle: u64, name: String },
    SetXattr { handle: u64, name: String, value: Vec<u8>, flags: u32 },
    ListXattr { handle: u64, token: u64, max_keys: u32 },
    RemoveXattr { handle: u64, name: String },
    FsMount { config: String },
    FsUnmount { id: u64 },
    Features { mask: u64 },
    Cancel { target_tag: u64 },
}

impl Request {
    pub fn op_type(&self) -> OpType {
        match self.body {
            RequestBody::Lookup { .. } => OpType::Lookup,
            RequestBody::Create { .. } => OpType::Create,
            RequestBody::Mkdir { .. } => OpType::Mkdir,
            RequestBody::Symlink { .. } => OpType::Symlink,
            RequestBody::FileIo { .. } => OpType::FileIo,
            RequestBody::Getattr { .. } => OpType::Getattr,
            RequestBody::Setattr { .. } => OpType::Setattr,
            RequestBody::Remove { .. } => OpType::Remove,
            RequestBody::Rename { .. } => OpType::Rename,
            RequestBody::Statfs => OpType::Statfs,
            RequestBody::Fsync { .. } => OpType::Fsync,
            RequestBody::Readdir { .. } => OpType::Readdir,
            RequestBody::GetXattr { .. } => OpType::GetXattr,
            RequestBody::SetXattr { .. } => OpType::SetXattr,
            RequestBody::ListXattr { .. } => OpType::ListXattr,
            RequestBody::RemoveXattr { .. } => OpType::RemoveXattr,
            RequestBody::FsMount { .. } => OpType::FsMount,
            RequestBody::FsUnmount { .. } => OpType::FsUnmount,
            RequestBody::Features { .. } => OpType::Features,
            RequestBody::Cancel { .. } => OpType::Cancel,
        }
    }

    /// Serialize into exactly [`REQUEST_UNION_SIZE`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() != REQUEST_UNION_SIZE {
            return Err(WireError::Malformed("request union buffer size"));
        }
        buf.fill(0);
        let mut cur = Cursor::new(buf);
        cur.write_u32::<LittleEndian>(self.op_type().as_u32())?;
        cur.write_i32::<LittleEndian>(self.fs_id)?;
        match &self.body {
            RequestBody::Lookup { parent, name } => {
                cur.write_u64::<LittleEndian>(*parent)?;
                put_bytes(&mut cur, name.as_bytes(), NAME_MAX, "name")?;
            }
            RequestBody::Create { parent, name, mode } | RequestBody::Mkdir { parent, name, mode } => {
                cur.write_u64::<LittleEndian>(*parent)?;
                put_bytes(&mut cur, name.as_bytes(), NAME_MAX, "name")?;
                cur.write_u32::<LittleEndian>(*mode)?;
            }
            RequestBody::Symlink { parent, name, target } => {
                cur.write_u64::<LittleEndian>(*parent)?;
                put_bytes(&mut cur, name.as_bytes(), NAME_MAX, "name")?;
                put_bytes(&mut cur, target.as_bytes(), TARGET_MAX, "target")?;
            }
            RequestBody::FileIo { handle, write, slot, offset, size } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                cur.write_u32::<LittleEndian>(u32::from(*write))?;
                cur.write_u32::<LittleEndian>(*slot)?;
                cur.write_i64::<LittleEndian>(*offset)?;
                cur.write_u64::<LittleEndian>(*size)?;
            }
            RequestBody::Getattr { handle, mask } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                cur.write_u32::<LittleEndian>(*mask)?;
            }
            RequestBody::Setattr { handle, attrs, valid } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                attrs.write_to(&mut cur)?;
                cur.write_u32::<LittleEndian>(*valid)?;
            }
            RequestBody::Remove { parent, name } => {
                cur.write_u64::<LittleEndian>(*parent)?;
                put_bytes(&mut cur, name.as_bytes(), NAME_MAX, "name")?;
            }
            RequestBody::Rename { old_parent, new_parent, old_name, new_name } => {
                cur.write_u64::<LittleEndian>(*old_parent)?;
                cur.write_u64::<LittleEndian>(*new_parent)?;
                put_bytes(&mut cur, old_name.as_bytes(), NAME_MAX, "old_name")?;
                put_bytes(&mut cur, new_name.as_bytes(), NAME_MAX, "new_name")?;
            }
            RequestBody::Statfs => {}
            RequestBody::Fsync { handle } => {
                cur.write_u64::<LittleEndian>(*handle)?;
            }
            RequestBody::Readdir { handle, token, max_entries } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                cur.write_u64::<LittleEndian>(*token)?;
                cur.write_u32::<LittleEndian>(*max_entries)?;
            }
            RequestBody::GetXattr { handle, name } | RequestBody::RemoveXattr { handle, name } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                put_bytes(&mut cur, name.as_bytes(), XATTR_NAME_MAX, "xattr name")?;
            }
            RequestBody::SetXattr { handle, name, value, flags } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                put_bytes(&mut cur, name.as_bytes(), XATTR_NAME_MAX, "xattr name")?;
                put_bytes(&mut cur, value, XATTR_VALUE_MAX, "xattr value")?;
                cur.write_u32::<LittleEndian>(*flags)?;
            }
            RequestBody::ListXattr { handle, token, max_keys } => {
                cur.write_u64::<LittleEndian>(*handle)?;
                cur.write_u64::<LittleEndian>(*token)?;
                cur.write_u32::<LittleEndian>(*max_keys)?;
            }
            RequestBody::FsMount { config } => {
                put_bytes(&mut cur, config.as_bytes(), TARGET_MAX, "mount config")?;
            }
            RequestBody::FsUnmount { id } => {
                cur.write_u64::<LittleEndian>(*id)?;
            }
            RequestBody::Features { mask } => {
                cur.write_u64::<LittleEndian>(*mask)?;
            }
            RequestBody::Cancel { target_tag } => {
                cur.write_u64::<LittleEndian>(*target_tag)?;
            }
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != REQUEST_UNION_SIZE {
            return Err(WireError::Malformed("request union buffer size"));
        }
        let mut cur = Cursor::new(buf);
        let op = OpType::from_u32(cur.read_u32::<LittleEndian>()?)?;
        let fs_id = cur.read_i32::<LittleEndian>()?;
        let body = match op {
            OpType::Lookup => RequestBody::Lookup {
                parent: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, NAME_MAX, "name")?,
            },
            OpType::Create => RequestBody::Create {
                parent: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, NAME_MAX, "name")?,
                mode: cur.read_u32::<LittleEndian>()?,
            },
            OpType::Mkdir => RequestBody::Mkdir {
                parent: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, NAME_MAX, "name")?,
                mode: cur.read_u32::<LittleEndian>()?,
            },
            OpType::Symlink => RequestBody::Symlink {
                parent: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, NAME_MAX, "name")?,
                target: get_string(&mut cur, TARGET_MAX, "target")?,
            },
            OpType::FileIo => RequestBody::FileIo {
                handle: cur.read_u64::<LittleEndian>()?,
                write: cur.read_u32::<LittleEndian>()? != 0,
                slot: cur.read_u32::<LittleEndian>()?,
                offset: cur.read_i64::<LittleEndian>()?,
                size: cur.read_u64::<LittleEndian>()?,
            },
            OpType::Getattr => RequestBody::Getattr {
                handle: cur.read_u64::<LittleEndian>()?,
                mask: cur.read_u32::<LittleEndian>()?,
            },
            OpType::Setattr => RequestBody::Setattr {
                handle: cur.read_u64::<LittleEndian>()?,
                attrs: ObjectAttrs::read_from(&mut cur)?,
                valid: cur.read_u32::<LittleEndian>()?,
            },
            OpType::Remove => RequestBody::Remove {
                parent: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, NAME_MAX, "name")?,
            },
            OpType::Rename => RequestBody::Rename {
                old_parent: cur.read_u64::<LittleEndian>()?,
                new_parent: cur.read_u64::<LittleEndian>()?,
                old_name: get_string(&mut cur, NAME_MAX, "old_name")?,
                new_name: get_string(&mut cur, NAME_MAX, "new_name")?,
            },
            OpType::Statfs => RequestBody::Statfs,
            OpType::Fsync => RequestBody::Fsync { handle: cur.read_u64::<LittleEndian>()? },
            OpType::Readdir => RequestBody::Readdir {
                handle: cur.read_u64::<LittleEndian>()?,
                token: cur.read_u64::<LittleEndian>()?,
                max_entries: cur.read_u32::<LittleEndian>()?,
            },
            OpType::GetXattr => RequestBody::GetXattr {
                handle: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, XATTR_NAME_MAX, "xattr name")?,
            },
            OpType::SetXattr => RequestBody::SetXattr {
                handle: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, XATTR_NAME_MAX, "xattr name")?,
                value: get_bytes(&mut cur, XATTR_VALUE_MAX, "xattr value")?,
                flags: cur.read_u32::<LittleEndian>()?,
            },
            OpType::ListXattr => RequestBody::ListXattr {
                handle: cur.read_u64::<LittleEndian>()?,
                token: cur.read_u64::<LittleEndian>()?,
                max_keys: cur.read_u32::<LittleEndian>()?,
            },
            OpType::RemoveXattr => RequestBody::RemoveXattr {
                handle: cur.read_u64::<LittleEndian>()?,
                name: get_string(&mut cur, XATTR_NAME_MAX, "xattr name")?,
            },
            OpType::FsMount => RequestBody::FsMount {
                config: get_string(&mut cur, TARGET_MAX, "mount config")?,
            },
            OpType::FsUnmount => RequestBody::FsUnmount { id: cur.read_u64::<LittleEndian>()? },
            OpType::Features => RequestBody::Features { mask: cur.read_u64::<LittleEndian>()? },
            OpType::Cancel => RequestBody::Cancel { target_tag: cur.read_u64::<LittleEndian>()? },
        };
        Ok(Request { fs_id, body })
    }
}

/// One response as written back through the device.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// 0 on success, negative errno-style failure otherwise.
    pub status: i32,
    pub body: ResponseBody,
}

/// Per-operation response payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Lookup { handle: u64 },
    Create { handle: u64 },
    Mkdir { handle: u64 },
    Symlink { handle: u64 },
    FileIo { amount: u64 },
    Getattr { attrs: ObjectAttrs, link_target: Option<String> },
    Setattr,
    Remove,
    Rename,
    Statfs(StatfsData),
    Fsync,
    /// Entries travel in the trailer; the union only carries paging state.
    Readdir { token: u64, entry_count: u32 },
    GetXattr { value: Vec<u8> },
    SetXattr,
    ListXattr { token: u64, keys: Vec<String> },
    RemoveXattr,
    FsMount { fs_id: i32, root_handle: u64, id: u64 },
    FsUnmount,
    Features { mask: u64 },
    Cancel,
}

impl Response {
    pub fn op_type(&self) -> OpType {
        match self.body {
            ResponseBody::Lookup { .. } => OpType::Lookup,
            ResponseBody::Create { .. } => OpType::Create,
            ResponseBody::Mkdir { .. } => OpType::Mkdir,
            ResponseBody::Symlink { .. } => OpType::Symlink,
            ResponseBody::FileIo { .. } => OpType::FileIo,
            ResponseBody::Getattr { .. } => OpType::Getattr,
            ResponseBody::Setattr => OpType::Setattr,
            ResponseBody::Remove => OpType::Remove,
            ResponseBody::Rename => OpType::Rename,
            ResponseBody::Statfs(_) => OpType::Statfs,
            ResponseBody::Fsync => OpType::Fsync,
            ResponseBody::Readdir { .. } => OpType::Readdir,
            ResponseBody::GetXattr { .. } => OpType::GetXattr,
            ResponseBody::SetXattr => OpType::SetXattr,
            ResponseBody::ListXattr { .. } => OpType::ListXattr,
            ResponseBody::RemoveXattr => OpType::RemoveXattr,
            ResponseBody::FsMount { .. } => OpType::FsMount,
            ResponseBody::FsUnmount => OpType::FsUnmount,
            ResponseBody::Features { .. } => OpType::Features,
            ResponseBody::Cancel => OpType::Cancel,
        }
    }

    /// Serialize into exactly [`RESPONSE_UNION_SIZE`] bytes. `trailer_size`
    /// is the length of the trailer the caller will append after the union.
    pub fn encode_into(&self, buf: &mut [u8], trailer_size: u64) -> Result<(), WireError> {
        if buf.len() != RESPONSE_UNION_SIZE {
            return Err(WireError::Malformed("response union buffer size"));
        }
        buf.fill(0);
        let mut cur = Cursor::new(buf);
        cur.write_u32::<LittleEndian>(self.op_type().as_u32())?;
        cur.write_i32::<LittleEndian>(self.status)?;
        cur.write_u64::<LittleEndian>(trailer_size)?;
        match &self.body {
            ResponseBody::Lookup { handle }
            | ResponseBody::Create { handle }
            | ResponseBody::Mkdir { handle }
            | ResponseBody::Symlink { handle } => {
                cur.write_u64::<LittleEndian>(*handle)?;
            }
            ResponseBody::FileIo { amount } => {
                cur.write_u64::<LittleEndian>(*amount)?;
            }
            ResponseBody::Getattr { attrs, link_target } => {
                attrs.write_to(&mut cur)?;
                let target = link_target.as_deref().unwrap_or("");
                put_bytes(&mut cur, target.as_bytes(), TARGET_MAX, "link target")?;
            }
            ResponseBody::Statfs(stats) => {
                cur.write_u64::<LittleEndian>(stats.block_size)?;
                cur.write_u64::<LittleEndian>(stats.blocks_total)?;
                cur.write_u64::<LittleEndian>(stats.blocks_avail)?;
                cur.write_u64::<LittleEndian>(stats.files_total)?;
                cur.write_u64::<LittleEndian>(stats.files_avail)?;
            }
            ResponseBody::Readdir { token, entry_count } => {
                cur.write_u64::<LittleEndian>(*token)?;
                cur.write_u32::<LittleEndian>(*entry_count)?;
            }
            ResponseBody::GetXattr { value } => {
                put_bytes(&mut cur, value, XATTR_VALUE_MAX, "xattr value")?;
            }
            ResponseBody::ListXattr { token, keys } => {
                if keys.len() > LISTXATTR_MAX_KEYS {
                    return Err(WireError::Oversize("xattr key list"));
                }
                cur.write_u64::<LittleEndian>(*token)?;
                cur.write_u32::<LittleEndian>(keys.len() as u32)?;
                for key in keys {
                    put_bytes(&mut cur, key.as_bytes(), XATTR_NAME_MAX, "xattr name")?;
                }
            }
            ResponseBody::FsMount { fs_id, root_handle, id } => {
                cur.write_i32::<LittleEndian>(*fs_id)?;
                cur.write_u64::<LittleEndian>(*root_handle)?;
                cur.write_u64::<LittleEndian>(*id)?;
            }
            ResponseBody::Features { mask } => {
                cur.write_u64::<LittleEndian>(*mask)?;
            }
            ResponseBody::Setattr
            | ResponseBody::Remove
            | ResponseBody::Rename
            | ResponseBody::Fsync
            | ResponseBody::SetXattr
            | ResponseBody::RemoveXattr
            | ResponseBody::FsUnmount
            | ResponseBody::Cancel => {}
        }
        Ok(())
    }

    /// Decode a response union; returns the response and its declared
    /// trailer size.
    pub fn decode(buf: &[u8]) -> Result<(Self, u64), WireError> {
        if buf.len() != RESPONSE_UNION_SIZE {
            return Err(WireError::Malformed("response union buffer size"));
        }
        let mut cur = Cursor::new(buf);
        let op = OpType::from_u32(cur.read_u32::<LittleEndian>()?)?;
        let status = cur.read_i32::<LittleEndian>()?;
        let trailer_size = cur.read_u64::<LittleEndian>()?;
        let body = match op {
            OpType::Lookup => ResponseBody::Lookup { handle: cur.read_u64::<LittleEndian>()? },
            OpType::Create => ResponseBody::Create { handle: cur.read_u64::<LittleEndian>()? },
            OpType::Mkdir => ResponseBody::Mkdir { handle: cur.read_u64::<LittleEndian>()? },
            OpType::Symlink => ResponseBody::Symlink { handle: cur.read_u64::<LittleEndian>()? },
            OpType::FileIo => ResponseBody::FileIo { amount: cur.read_u64::<LittleEndian>()? },
            OpType::Getattr => {
                let attrs = ObjectAttrs::read_from(&mut cur)?;
                let target = get_string(&mut cur, TARGET_MAX, "link target")?;
                ResponseBody::Getattr {
                    attrs,
                    link_target: if target.is_empty() { None } else { Some(target) },
                }
            }
            OpType::Setattr => ResponseBody::Setattr,
            OpType::Remove => ResponseBody::Remove,
            OpType::Rename => ResponseBody::Rename,
            OpType::Statfs => ResponseBody::Statfs(StatfsData {
                block_size: cur.read_u64::<LittleEndian>()?,
                blocks_total: cur.read_u64::<LittleEndian>()?,
                blocks_avail: cur.read_u64::<LittleEndian>()?,
                files_total: cur.read_u64::<LittleEndian>()?,
                files_avail: cur.read_u64::<LittleEndian>()?,
            }),
            OpType::Fsync => ResponseBody::Fsync,
            OpType::Readdir => ResponseBody::Readdir {
                token: cur.read_u64::<LittleEndian>()?,
                entry_count: cur.read_u32::<LittleEndian>()?,
            },
            OpType::GetXattr => {
                ResponseBody::GetXattr { value: get_bytes(&mut cur, XATTR_VALUE_MAX, "xattr value")? }
            }
            OpType::SetXattr => ResponseBody::SetXattr,
            OpType::ListXattr => {
                let token = cur.read_u64::<LittleEndian>()?;
                let count = cur.read_u32::<LittleEndian>()? as usize;
                if count > LISTXATTR_MAX_KEYS {
                    return Err(WireError::Oversize("xattr key list"));
                }
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(get_string(&mut cur, XATTR_NAME_MAX, "xattr name")?);
                }
                ResponseBody::ListXattr { token, keys }
            }
            OpType::RemoveXattr => ResponseBody::RemoveXattr,
            OpType::FsMount => ResponseBody::FsMount {
                fs_id: cur.read_i32::<LittleEndian>()?,
                root_handle: cur.read_u64::<LittleEndian>()?,
                id: cur.read_u64::<LittleEndian>()?,
            },
            OpType::FsUnmount => ResponseBody::FsUnmount,
            OpType::Features => ResponseBody::Features { mask: cur.read_u64::<LittleEndian>()? },
            OpType::Cancel => ResponseBody::Cancel,
        };
        Ok((Response { status, body }, trailer_size))
    }
}

/// One directory entry in the readdir trailer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireDirent {
    pub handle: u64,
    pub objtype: u32,
    pub name: String,
}

/// The readdir trailer: a packed page of directory entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirentPage {
    pub entries: Vec<WireDirent>,
}

impl DirentPage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for ent in &self.entries {
            if ent.name.len() > NAME_MAX {
                return Err(WireError::Oversize("dirent name"));
            }
            out.write_u64::<LittleEndian>(ent.handle)?;
            out.write_u32::<LittleEndian>(ent.objtype)?;
            out.write_u32::<LittleEndian>(ent.name.len() as u32)?;
            out.extend_from_slice(ent.name.as_bytes());
        }
        if out.len() > MAX_TRAILER_SIZE {
            return Err(WireError::Oversize("readdir trailer"));
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        let count = cur.read_u32::<LittleEndian>()? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let handle = cur.read_u64::<LittleEndian>()?;
            let objtype = cur.read_u32::<LittleEndian>()?;
            let name = get_string(&mut cur, NAME_MAX, "dirent name")?;
            entries.push(WireDirent { handle, objtype, name });
        }
        Ok(DirentPage { entries })
    }
}

/// Build one complete upcall record (daemon-bound).
pub fn encode_upcall(version: u32, tag: u64, request: &Request, buf: &mut [u8]) -> Result<(), WireError> {
    if buf.len() != UPCALL_RECORD_SIZE {
        return Err(WireError::Malformed("upcall record buffer size"));
    }
    let header = RecordHeader { version, magic: PROTO_MAGIC, tag };
    header.encode_into(&mut buf[..HEADER_SIZE])?;
    request.encode_into(&mut buf[HEADER_SIZE..])?;
    Ok(())
}

/// Parse one complete upcall record (daemon side).
pub fn decode_upcall(buf: &[u8]) -> Result<(RecordHeader, Request), WireError> {
    if buf.len() != UPCALL_RECORD_SIZE {
        return Err(WireError::Malformed("upcall record buffer size"));
    }
    let header = RecordHeader::decode(&buf[..HEADER_SIZE])?;
    crate::validation::validate_header(&header)?;
    let request = Request::decode(&buf[HEADER_SIZE..])?;
    Ok((header, request))
}

/// Build one complete downcall write (daemon side).
pub fn encode_downcall(
    version: u32,
    tag: u64,
    response: &Response,
    trailer: Option<&[u8]>,
) -> Result<Vec<u8>, WireError> {
    let trailer_size = trailer.map_or(0, <[u8]>::len);
    if trailer_size > MAX_TRAILER_SIZE {
        return Err(WireError::Oversize("trailer"));
    }
    let mut out = vec![0u8; DOWNCALL_FIXED_SIZE + trailer_size];
    let header = RecordHeader { version, magic: PROTO_MAGIC, tag };
    header.encode_into(&mut out[..HEADER_SIZE])?;
    response.encode_into(&mut out[HEADER_SIZE..DOWNCALL_FIXED_SIZE], trailer_size as u64)?;
    if let Some(trailer) = trailer {
        out[DOWNCALL_FIXED_SIZE..].copy_from_slice(trailer);
    }
    Ok(out)
}

fn put_bytes(
    cur: &mut Cursor<&mut [u8]>,
    bytes: &[u8],
    max: usize,
    field: &'static str,
) -> Result<(), WireError> {
    if bytes.len() > max {
        return Err(WireError::Oversize(field));
    }
    cur.write_u32::<LittleEndian>(bytes.len() as u32)?;
    cur.write_all(bytes)?;
    Ok(())
}

fn get_bytes(cur: &mut Cursor<&[u8]>, max: usize, field: &'static str) -> Result<Vec<u8>, WireError> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    if len > max {
        return Err(WireError::Oversize(field));
    }
    let mut out = vec![0u8; len];
    cur.read_exact(&mut out)?;
    Ok(out)
}

fn get_string(cur: &mut Cursor<&[u8]>, max: usize, field: &'static str) -> Result<String, WireError> {
    let bytes = get_bytes(cur, max, field)?;
    String::from_utf8(bytes).map_err(|_| WireError::Malformed(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(body: RequestBody) -> Request {
        let req = Request { fs_id: 7, body };
        let mut buf = [0u8; REQUEST_UNION_SIZE];
        req.encode_into(&mut buf).expect("encode should succeed");
        Request::decode(&buf).expect("decode should succeed")
    }

    #[test]
    fn test_lookup_request_roundtrip() {
        let decoded = roundtrip_request(RequestBody::Lookup {
            parent: 0x1122_3344_5566_7788,
            name: "config.txt".to_string(),
        });
        assert_eq!(decoded.fs_id, 7);
        assert_eq!(
            decoded.body,
            RequestBody::Lookup { parent: 0x1122_3344_5566_7788, name: "config.txt".to_string() }
        );
    }

    #[test]
    fn test_rename_request_roundtrip() {
        let decoded = roundtrip_request(RequestBody::Rename {
            old_parent: 1,
            new_parent: 2,
            old_name: "a".to_string(),
            new_name: "b".to_string(),
        });
        match decoded.body {
            RequestBody::Rename { old_name, new_name, .. } => {
                assert_eq!(old_name, "a");
                assert_eq!(new_name, "b");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_name_too_long_rejected() {
        let req = Request {
            fs_id: 0,
            body: RequestBody::Lookup { parent: 0, name: "x".repeat(NAME_MAX + 1) },
        };
        let mut buf = [0u8; REQUEST_UNION_SIZE];
        assert!(matches!(req.encode_into(&mut buf), Err(WireError::Oversize("name"))));
    }

    #[test]
    fn test_unknown_op_rejected() {
        let mut buf = [0u8; REQUEST_UNION_SIZE];
        buf[0] = 0xff;
        assert!(matches!(Request::decode(&buf), Err(WireError::UnknownOp(0xff))));
    }

    #[test]
    fn test_getattr_response_roundtrip() {
        let resp = Response {
            status: 0,
            body: ResponseBody::Getattr {
                attrs: ObjectAttrs {
                    mode: 0o644,
                    uid: 1000,
                    gid: 1000,
                    size: 4096,
                    atime: 1,
                    mtime: 2,
                    ctime: 3,
                    nlink: 1,
                    objtype: 1,
                },
                link_target: None,
            },
        };
        let mut buf = [0u8; RESPONSE_UNION_SIZE];
        resp.encode_into(&mut buf, 0).expect("encode should succeed");
        let (decoded, trailer_size) = Response::decode(&buf).expect("decode should succeed");
        assert_eq!(trailer_size, 0);
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_readdir_response_declares_trailer() {
        let resp = Response { status: 0, body: ResponseBody::Readdir { token: 9, entry_count: 2 } };
        let mut buf = [0u8; RESPONSE_UNION_SIZE];
        resp.encode_into(&mut buf, 64).expect("encode should succeed");
        let (_, trailer_size) = Response::decode(&buf).expect("decode should succeed");
        assert_eq!(trailer_size, 64);
    }

    #[test]
    fn test_dirent_page_roundtrip() {
        let page = DirentPage {
            entries: vec![
                WireDirent { handle: 10, objtype: 2, name: "subdir".to_string() },
                WireDirent { handle: 11, objtype: 1, name: "file.bin".to_string() },
            ],
        };
        let bytes = page.encode().expect("encode should succeed");
        assert_eq!(DirentPage::decode(&bytes).expect("decode should succeed"), page);
    }

    #[test]
    fn test_upcall_record_roundtrip() {
        let req = Request { fs_id: 3, body: RequestBody::Statfs };
        let mut buf = [0u8; UPCALL_RECORD_SIZE];
        encode_upcall(PROTO_VERSION, 42, &req, &mut buf).expect("encode should succeed");
        let (header, decoded) = decode_upcall(&buf).expect("decode should succeed");
        assert_eq!(header.tag, 42);
        assert_eq!(header.magic, PROTO_MAGIC);
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_downcall_record_layout() {
        let resp = Response { status: 0, body: ResponseBody::Fsync };
        let bytes = encode_downcall(PROTO_VERSION, 5, &resp, None).expect("encode should succeed");
        assert_eq!(bytes.len(), DOWNCALL_FIXED_SIZE);
        let header = RecordHeader::decode(&bytes[..HEADER_SIZE]).expect("header should decode");
        assert_eq!(header.tag, 5);
    }
}
