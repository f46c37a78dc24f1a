// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory request servicer
//!
//! Answers every upcall against a private filesystem tree. Handles live in
//! a flat table keyed by id; directories map names to child ids. Bulk file
//! I/O moves through per-slot staging buffers standing in for the shared
//! mapping a production deployment would register with the device.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use relayfs_proto::{
    DirentPage, ObjectAttrs, OpType, Request, RequestBody, Response, ResponseBody, StatfsData,
    WireDirent, ATTR_ATIME, ATTR_CTIME, ATTR_GID, ATTR_MODE, ATTR_MTIME, ATTR_SIZE, ATTR_UID,
    LISTXATTR_MAX_KEYS, OBJ_DIR, OBJ_FILE, OBJ_SYMLINK,
};

/// Feature bits this servicer advertises during negotiation.
pub const SUPPORTED_FEATURES: u64 = 0b111;

/// One fully-formed answer: the response union plus an optional trailer.
pub type Downcall = (Response, Option<Vec<u8>>);

/// Anything that can answer upcalls. The pump is generic over this so tests
/// can substitute scripted handlers.
pub trait UpcallHandler: Send {
    fn handle(&mut self, request: &Request) -> Downcall;
}

enum NodeContent {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
    Symlink(String),
}

struct Node {
    attrs: ObjectAttrs,
    content: NodeContent,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn new(mode: u32, objtype: u32, content: NodeContent) -> Self {
        let now = unix_now();
        Node {
            attrs: ObjectAttrs {
                mode,
                uid: 0,
                gid: 0,
                size: 0,
                atime: now,
                mtime: now,
                ctime: now,
                nlink: 1,
                objtype,
            },
            content,
            xattrs: BTreeMap::new(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub const ROOT_HANDLE: u64 = 1;

/// In-memory tree servicing the full operation set.
pub struct MemServicer {
    fs_id: i32,
    mount_id: u64,
    nodes: HashMap<u64, Node>,
    next_handle: u64,
    /// Staging buffers indexed by bulk slot number.
    slots: Vec<Vec<u8>>,
}

impl MemServicer {
    pub fn new(fs_id: i32) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_HANDLE, Node::new(0o755, OBJ_DIR, NodeContent::Dir(BTreeMap::new())));
        MemServicer { fs_id, mount_id: 1, nodes, next_handle: ROOT_HANDLE + 1, slots: Vec::new() }
    }

    /// Access a bulk slot's staging buffer, growing the pool on demand.
    pub fn slot_mut(&mut self, slot: u32) -> &mut Vec<u8> {
        let idx = slot as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, Vec::new);
        }
        &mut self.slots[idx]
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn dir_children(&self, handle: u64) -> Result<&BTreeMap<String, u64>, i32> {
        match &self.nodes.get(&handle).ok_or(-libc::ENOENT)?.content {
            NodeContent::Dir(children) => Ok(children),
            _ => Err(-libc::ENOTDIR),
        }
    }

    fn insert_child(
        &mut self,
        parent: u64,
        name: &str,
        node: Node,
    ) -> Result<u64, i32> {
        if self.dir_children(parent)?.contains_key(name) {
            return Err(-libc::EEXIST);
        }
        let handle = self.alloc_handle();
        self.nodes.insert(handle, node);
        match &mut self.nodes.get_mut(&parent).unwrap().content {
            NodeContent::Dir(children) => {
                children.insert(name.to_string(), handle);
            }
            _ => unreachable!("checked above"),
        }
        Ok(handle)
    }

    fn lookup(&self, parent: u64, name: &str) -> Result<u64, i32> {
        self.dir_children(parent)?.get(name).copied().ok_or(-libc::ENOENT)
    }

    fn remove(&mut self, parent: u64, name: &str) -> Result<(), i32> {
        let handle = self.lookup(parent, name)?;
        if let NodeContent::Dir(children) = &self.nodes[&handle].content {
            if !children.is_empty() {
                return Err(-libc::ENOTEMPTY);
            }
        }
        if let NodeContent::Dir(children) = &mut self.nodes.get_mut(&parent).unwrap().content {
            children.remove(name);
        }
        self.nodes.remove(&handle);
        Ok(())
    }

    fn rename(
        &mut self,
        old_parent: u64,
        new_parent: u64,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), i32> {
        let handle = self.lookup(old_parent, old_name)?;
        self.dir_children(new_parent)?;
        if let NodeContent::Dir(children) = &mut self.nodes.get_mut(&old_parent).unwrap().content {
            children.remove(old_name);
        }
        if let NodeContent::Dir(children) = &mut self.nodes.get_mut(&new_parent).unwrap().content {
            children.insert(new_name.to_string(), handle);
        }
        Ok(())
    }

    fn file_io(&mut self, handle: u64, write: bool, slot: u32, offset: i64, size: u64) -> Result<u64, i32> {
        if offset < 0 {
            return Err(-libc::EINVAL);
        }
        let offset = offset as usize;
        let size = size as usize;
        // Take the staging buffer out so the node borrow below is clean.
        let mut staging = std::mem::take(self.slot_mut(slot));
        let node = self.nodes.get_mut(&handle).ok_or(-libc::ENOENT)?;
        let data = match &mut node.content {
            NodeContent::File(data) => data,
            NodeContent::Dir(_) => return Err(-libc::EISDIR),
            NodeContent::Symlink(_) => return Err(-libc::EINVAL),
        };
        let amount = if write {
            let payload = staging.get(..size).ok_or(-libc::EINVAL)?;
            if data.len() < offset + size {
                data.resize(offset + size, 0);
            }
            data[offset..offset + size].copy_from_slice(payload);
            node.attrs.size = data.len() as u64;
            node.attrs.mtime = unix_now();
            size
        } else {
            let end = data.len().min(offset + size);
            let chunk = if offset < data.len() { &data[offset..end] } else { &[][..] };
            staging.clear();
            staging.extend_from_slice(chunk);
            chunk.len()
        };
        *self.slot_mut(slot) = staging;
        Ok(amount as u64)
    }

    fn setattr(&mut self, handle: u64, attrs: &ObjectAttrs, valid: u32) -> Result<(), i32> {
        let node = self.nodes.get_mut(&handle).ok_or(-libc::ENOENT)?;
        if valid & ATTR_MODE != 0 {
            node.attrs.mode = attrs.mode;
        }
        if valid & ATTR_UID != 0 {
            node.attrs.uid = attrs.uid;
        }
        if valid & ATTR_GID != 0 {
            node.attrs.gid = attrs.gid;
        }
        if valid & ATTR_SIZE != 0 {
            if let NodeContent::File(data) = &mut node.content {
                data.resize(attrs.size as usize, 0);
                node.attrs.size = attrs.size;
            } else {
                return Err(-libc::EISDIR);
            }
        }
        if valid & ATTR_ATIME != 0 {
            node.attrs.atime = attrs.atime;
        }
        if valid & ATTR_MTIME != 0 {
            node.attrs.mtime = attrs.mtime;
        }
        if valid & ATTR_CTIME != 0 {
            node.attrs.ctime = attrs.ctime;
        }
        Ok(())
    }

    fn readdir(&self, handle: u64, token: u64, max_entries: u32) -> Result<(u64, DirentPage), i32> {
        let children = self.dir_children(handle)?;
        let entries: Vec<WireDirent> = children
            .iter()
            .skip(token as usize)
            .take(max_entries as usize)
            .map(|(name, &child)| WireDirent {
                handle: child,
                objtype: self.nodes[&child].attrs.objtype,
                name: name.clone(),
            })
            .collect();
        let next_token = token + entries.len() as u64;
        Ok((next_token, DirentPage { entries }))
    }

    fn statfs(&self) -> StatfsData {
        let used: u64 = self
            .nodes
            .values()
            .map(|n| match &n.content {
                NodeContent::File(data) => data.len() as u64,
                _ => 0,
            })
            .sum();
        let block_size = 4096u64;
        let blocks_total = 1 << 20;
        StatfsData {
            block_size,
            blocks_total,
            blocks_avail: blocks_total - used.div_ceil(block_size),
            files_total: 1 << 20,
            files_avail: (1 << 20) - self.nodes.len() as u64,
        }
    }

    fn list_xattr(&self, handle: u64, token: u64, max_keys: u32) -> Result<(u64, Vec<String>), i32> {
        let node = self.nodes.get(&handle).ok_or(-libc::ENOENT)?;
        let cap = (max_keys as usize).min(LISTXATTR_MAX_KEYS);
        let keys: Vec<String> =
            node.xattrs.keys().skip(token as usize).take(cap).cloned().collect();
        let next_token = token + keys.len() as u64;
        Ok((next_token, keys))
    }
}

/// Zero-valued body matching an op type, for failure responses: the kernel
/// side cross-checks the body's op code against the operation it resolves.
fn empty_body(op: OpType) -> ResponseBody {
    match op {
        OpType::Lookup => ResponseBody::Lookup { handle: 0 },
        OpType::Create => ResponseBody::Create { handle: 0 },
        OpType::Mkdir => ResponseBody::Mkdir { handle: 0 },
        OpType::Symlink => ResponseBody::Symlink { handle: 0 },
        OpType::FileIo => ResponseBody::FileIo { amount: 0 },
        OpType::Getattr => {
            ResponseBody::Getattr { attrs: ObjectAttrs::default(), link_target: None }
        }
        OpType::Setattr => ResponseBody::Setattr,
        OpType::Remove => ResponseBody::Remove,
        OpType::Rename => ResponseBody::Rename,
        OpType::Statfs => ResponseBody::Statfs(StatfsData::default()),
        OpType::Fsync => ResponseBody::Fsync,
        OpType::Readdir => ResponseBody::Readdir { token: 0, entry_count: 0 },
        OpType::GetXattr => ResponseBody::GetXattr { value: Vec::new() },
        OpType::SetXattr => ResponseBody::SetXattr,
        OpType::ListXattr => ResponseBody::ListXattr { token: 0, keys: Vec::new() },
        OpType::RemoveXattr => ResponseBody::RemoveXattr,
        OpType::FsMount => ResponseBody::FsMount { fs_id: 0, root_handle: 0, id: 0 },
        OpType::FsUnmount => ResponseBody::FsUnmount,
        OpType::Features => ResponseBody::Features { mask: 0 },
        OpType::Cancel => ResponseBody::Cancel,
    }
}

impl UpcallHandler for MemServicer {
    fn handle(&mut self, request: &Request) -> Downcall {
        let op = request.op_type();
        let result: Result<Downcall, i32> = match &request.body {
            RequestBody::Lookup { parent, name } => self
                .lookup(*parent, name)
                .map(|handle| (Response { status: 0, body: ResponseBody::Lookup { handle } }, None)),
            RequestBody::Create { parent, name, mode } => self
                .insert_child(*parent, name, Node::new(*mode, OBJ_FILE, NodeContent::File(Vec::new())))
                .map(|handle| (Response { status: 0, body: ResponseBody::Create { handle } }, None)),
            RequestBody::Mkdir { parent, name, mode } => self
                .insert_child(
                    *parent,
                    name,
                    Node::new(*mode, OBJ_DIR, NodeContent::Dir(BTreeMap::new())),
                )
                .map(|handle| (Response { status: 0, body: ResponseBody::Mkdir { handle } }, None)),
            RequestBody::Symlink { parent, name, target } => self
                .insert_child(
                    *parent,
                    name,
                    Node::new(0o777, OBJ_SYMLINK, NodeContent::Symlink(target.clone())),
                )
                .map(|handle| (Response { status: 0, body: ResponseBody::Symlink { handle } }, None)),
            RequestBody::FileIo { handle, write, slot, offset, size } => self
                .file_io(*handle, *write, *slot, *offset, *size)
                .map(|amount| (Response { status: 0, body: ResponseBody::FileIo { amount } }, None)),
            RequestBody::Getattr { handle, .. } => {
                match self.nodes.get(handle) {
                    Some(node) => {
                        let link_target = match &node.content {
                            NodeContent::Symlink(target) => Some(target.clone()),
                            _ => None,
                        };
                        Ok((
                            Response {
                                status: 0,
                                body: ResponseBody::Getattr { attrs: node.attrs, link_target },
                            },
                            None,
                        ))
                    }
                    None => Err(-libc::ENOENT),
                }
            }
            RequestBody::Setattr { handle, attrs, valid } => self
                .setattr(*handle, attrs, *valid)
                .map(|()| (Response { status: 0, body: ResponseBody::Setattr }, None)),
            RequestBody::Remove { parent, name } => self
                .remove(*parent, name)
                .map(|()| (Response { status: 0, body: ResponseBody::Remove }, None)),
            RequestBody::Rename { old_parent, new_parent, old_name, new_name } => self
                .rename(*old_parent, *new_parent, old_name, new_name)
                .map(|()| (Response { status: 0, body: ResponseBody::Rename }, None)),
            RequestBody::Statfs => Ok((
                Response { status: 0, body: ResponseBody::Statfs(self.statfs()) },
                None,
            )),
            RequestBody::Fsync { handle } => {
                if self.nodes.contains_key(handle) {
                    Ok((Response { status: 0, body: ResponseBody::Fsync }, None))
                } else {
                    Err(-libc::ENOENT)
                }
            }
            RequestBody::Readdir { handle, token, max_entries } => {
                self.readdir(*handle, *token, *max_entries).and_then(|(next_token, page)| {
                    let entry_count = page.entries.len() as u32;
                    let trailer = page.encode().map_err(|_| -libc::EIO)?;
                    Ok((
                        Response {
                            status: 0,
                            body: ResponseBody::Readdir { token: next_token, entry_count },
                        },
                        Some(trailer),
                    ))
                })
            }
            RequestBody::GetXattr { handle, name } => self
                .nodes
                .get(handle)
                .ok_or(-libc::ENOENT)
                .and_then(|node| node.xattrs.get(name).cloned().ok_or(-libc::ENODATA))
                .map(|value| {
                    (Response { status: 0, body: ResponseBody::GetXattr { value } }, None)
                }),
            RequestBody::SetXattr { handle, name, value, .. } => self
                .nodes
                .get_mut(handle)
                .ok_or(-libc::ENOENT)
                .map(|node| {
                    node.xattrs.insert(name.clone(), value.clone());
                    (Response { status: 0, body: ResponseBody::SetXattr }, None)
                }),
            RequestBody::ListXattr { handle, token, max_keys } => self
                .list_xattr(*handle, *token, *max_keys)
                .map(|(next_token, keys)| {
                    (
                        Response {
                            status: 0,
                            body: ResponseBody::ListXattr { token: next_token, keys },
                        },
                        None,
                    )
                }),
            RequestBody::RemoveXattr { handle, name } => self
                .nodes
                .get_mut(handle)
                .ok_or(-libc::ENOENT)
                .and_then(|node| node.xattrs.remove(name).map(|_| ()).ok_or(-libc::ENODATA))
                .map(|()| (Response { status: 0, body: ResponseBody::RemoveXattr }, None)),
            RequestBody::FsMount { config } => {
                tracing::info!(config, "servicing mount");
                self.mount_id += 1;
                Ok((
                    Response {
                        status: 0,
                        body: ResponseBody::FsMount {
                            fs_id: self.fs_id,
                            root_handle: ROOT_HANDLE,
                            id: self.mount_id,
                        },
                    },
                    None,
                ))
            }
            RequestBody::FsUnmount { id } => {
                tracing::info!(id, "servicing unmount");
                Ok((Response { status: 0, body: ResponseBody::FsUnmount }, None))
            }
            RequestBody::Features { mask } => Ok((
                Response {
                    status: 0,
                    body: ResponseBody::Features { mask: mask & SUPPORTED_FEATURES },
                },
                None,
            )),
            RequestBody::Cancel { target_tag } => {
                // Operations here complete synchronously, so by the time a
                // cancellation arrives there is nothing left to abort.
                tracing::debug!(target_tag, "cancellation acknowledged");
                Ok((Response { status: 0, body: ResponseBody::Cancel }, None))
            }
        };
        match result {
            Ok(downcall) => downcall,
            Err(status) => {
                tracing::debug!(op = %op, status, "operation failed");
                (Response { status, body: empty_body(op) }, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servicer() -> MemServicer {
        MemServicer::new(7)
    }

    fn handle_of(downcall: &Downcall) -> u64 {
        match downcall.0.body {
            ResponseBody::Lookup { handle }
            | ResponseBody::Create { handle }
            | ResponseBody::Mkdir { handle }
            | ResponseBody::Symlink { handle } => handle,
            ref other => panic!("no handle in {other:?}"),
        }
    }

    fn req(body: RequestBody) -> Request {
        Request { fs_id: 7, body }
    }

    #[test]
    fn test_create_then_lookup() {
        let mut s = servicer();
        let created = s.handle(&req(RequestBody::Create {
            parent: ROOT_HANDLE,
            name: "a.txt".into(),
            mode: 0o644,
        }));
        assert_eq!(created.0.status, 0);
        let found =
            s.handle(&req(RequestBody::Lookup { parent: ROOT_HANDLE, name: "a.txt".into() }));
        assert_eq!(handle_of(&created), handle_of(&found));
    }

    #[test]
    fn test_lookup_missing_is_enoent() {
        let mut s = servicer();
        let out = s.handle(&req(RequestBody::Lookup { parent: ROOT_HANDLE, name: "nope".into() }));
        assert_eq!(out.0.status, -libc::ENOENT);
        assert_eq!(out.0.op_type(), OpType::Lookup);
    }

    #[test]
    fn test_duplicate_create_is_eexist() {
        let mut s = servicer();
        let body = RequestBody::Create { parent: ROOT_HANDLE, name: "a".into(), mode: 0o644 };
        assert_eq!(s.handle(&req(body.clone())).0.status, 0);
        assert_eq!(s.handle(&req(body)).0.status, -libc::EEXIST);
    }

    #[test]
    fn test_file_io_write_then_read() {
        let mut s = servicer();
        let created = s.handle(&req(RequestBody::Create {
            parent: ROOT_HANDLE,
            name: "data".into(),
            mode: 0o644,
        }));
        let handle = handle_of(&created);

        s.slot_mut(0).extend_from_slice(b"hello relay");
        let wrote = s.handle(&req(RequestBody::FileIo {
            handle,
            write: true,
            slot: 0,
            offset: 0,
            size: 11,
        }));
        assert_eq!(wrote.0, Response { status: 0, body: ResponseBody::FileIo { amount: 11 } });

        let read = s.handle(&req(RequestBody::FileIo {
            handle,
            write: false,
            slot: 1,
            offset: 6,
            size: 64,
        }));
        assert_eq!(read.0, Response { status: 0, body: ResponseBody::FileIo { amount: 5 } });
        assert_eq!(s.slot_mut(1).as_slice(), b"relay");
    }

    #[test]
    fn test_readdir_pages_in_name_order() {
        let mut s = servicer();
        for name in ["c", "a", "b"] {
            s.handle(&req(RequestBody::Create {
                parent: ROOT_HANDLE,
                name: name.into(),
                mode: 0o644,
            }));
        }
        let out = s.handle(&req(RequestBody::Readdir {
            handle: ROOT_HANDLE,
            token: 0,
            max_entries: 2,
        }));
        let page = DirentPage::decode(out.1.as_deref().unwrap()).unwrap();
        assert_eq!(
            page.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let ResponseBody::Readdir { token, entry_count } = out.0.body else { unreachable!() };
        assert_eq!((token, entry_count), (2, 2));

        let rest = s.handle(&req(RequestBody::Readdir {
            handle: ROOT_HANDLE,
            token,
            max_entries: 2,
        }));
        let page = DirentPage::decode(rest.1.as_deref().unwrap()).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].name, "c");
    }

    #[test]
    fn test_readdir_always_carries_trailer() {
        let mut s = servicer();
        let out = s.handle(&req(RequestBody::Readdir {
            handle: ROOT_HANDLE,
            token: 0,
            max_entries: 16,
        }));
        assert_eq!(out.0.status, 0);
        // Even an empty directory page travels as a trailer.
        assert!(out.1.is_some());
    }

    #[test]
    fn test_remove_nonempty_dir_rejected() {
        let mut s = servicer();
        let dir = s.handle(&req(RequestBody::Mkdir {
            parent: ROOT_HANDLE,
            name: "d".into(),
            mode: 0o755,
        }));
        s.handle(&req(RequestBody::Create {
            parent: handle_of(&dir),
            name: "child".into(),
            mode: 0o644,
        }));
        let out = s.handle(&req(RequestBody::Remove { parent: ROOT_HANDLE, name: "d".into() }));
        assert_eq!(out.0.status, -libc::ENOTEMPTY);
    }

    #[test]
    fn test_symlink_reports_target_in_getattr() {
        let mut s = servicer();
        let link = s.handle(&req(RequestBody::Symlink {
            parent: ROOT_HANDLE,
            name: "l".into(),
            target: "/elsewhere".into(),
        }));
        let out = s.handle(&req(RequestBody::Getattr { handle: handle_of(&link), mask: 0 }));
        match out.0.body {
            ResponseBody::Getattr { attrs, link_target } => {
                assert_eq!(attrs.objtype, OBJ_SYMLINK);
                assert_eq!(link_target.as_deref(), Some("/elsewhere"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_xattr_lifecycle() {
        let mut s = servicer();
        let set = RequestBody::SetXattr {
            handle: ROOT_HANDLE,
            name: "user.color".into(),
            value: b"teal".to_vec(),
            flags: 0,
        };
        assert_eq!(s.handle(&req(set)).0.status, 0);

        let got =
            s.handle(&req(RequestBody::GetXattr { handle: ROOT_HANDLE, name: "user.color".into() }));
        assert_eq!(got.0.body, ResponseBody::GetXattr { value: b"teal".to_vec() });

        let listed = s.handle(&req(RequestBody::ListXattr {
            handle: ROOT_HANDLE,
            token: 0,
            max_keys: 16,
        }));
        let ResponseBody::ListXattr { keys, .. } = listed.0.body else { unreachable!() };
        assert_eq!(keys, vec!["user.color".to_string()]);

        assert_eq!(
            s.handle(&req(RequestBody::RemoveXattr {
                handle: ROOT_HANDLE,
                name: "user.color".into()
            }))
            .0
            .status,
            0
        );
        let gone =
            s.handle(&req(RequestBody::GetXattr { handle: ROOT_HANDLE, name: "user.color".into() }));
        assert_eq!(gone.0.status, -libc::ENODATA);
    }

    #[test]
    fn test_features_masked_to_supported() {
        let mut s = servicer();
        let out = s.handle(&req(RequestBody::Features { mask: u64::MAX }));
        assert_eq!(out.0.body, ResponseBody::Features { mask: SUPPORTED_FEATURES });
    }

    #[test]
    fn test_truncate_via_setattr() {
        let mut s = servicer();
        let created = s.handle(&req(RequestBody::Create {
            parent: ROOT_HANDLE,
            name: "t".into(),
            mode: 0o644,
        }));
        let handle = handle_of(&created);
        s.slot_mut(0).extend_from_slice(&[7u8; 100]);
        s.handle(&req(RequestBody::FileIo { handle, write: true, slot: 0, offset: 0, size: 100 }));

        let attrs = ObjectAttrs { size: 10, ..Default::default() };
        let out = s.handle(&req(RequestBody::Setattr { handle, attrs, valid: ATTR_SIZE }));
        assert_eq!(out.0.status, 0);

        let got = s.handle(&req(RequestBody::Getattr { handle, mask: 0 }));
        let ResponseBody::Getattr { attrs, .. } = got.0.body else { unreachable!() };
        assert_eq!(attrs.size, 10);
    }
}
