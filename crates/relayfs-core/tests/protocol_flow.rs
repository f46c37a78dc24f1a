// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end protocol flows over one in-process session: an issuing
//! caller thread on one side, a daemon driving the request device on the
//! other.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use relayfs_core::{
    DevError, OpError, ProtocolConfig, ServiceOptions, Session, SliceBuffer,
};
use relayfs_proto::{
    decode_upcall, encode_downcall, DirentPage, ObjectAttrs, OpType, Request, RequestBody,
    Response, ResponseBody, WireDirent, PROTO_VERSION, UPCALL_RECORD_SIZE,
};

fn long_wait() -> ServiceOptions {
    ServiceOptions { timeout: Some(Duration::from_secs(10)), fail_fast: false }
}

/// Pull exactly one upcall off the device, polling until it shows up.
fn read_one(conn: &relayfs_core::DaemonConn) -> (u64, Request) {
    let mut raw = vec![0u8; UPCALL_RECORD_SIZE];
    loop {
        assert!(conn.poll_readable(Duration::from_secs(5)), "no upcall arrived");
        match conn.read_upcall(&mut SliceBuffer::new(&mut raw)) {
            Ok(_) => break,
            Err(DevError::WouldBlock) => continue,
            Err(err) => panic!("read failed: {err}"),
        }
    }
    let (header, request) = decode_upcall(&raw).expect("upcall should decode");
    (header.tag, request)
}

fn write_one(conn: &relayfs_core::DaemonConn, tag: u64, response: &Response, trailer: Option<&[u8]>) {
    let mut bytes = encode_downcall(PROTO_VERSION, tag, response, trailer).unwrap();
    conn.write_downcall(&SliceBuffer::new(&mut bytes)).expect("write should succeed");
}

#[test]
fn test_getattr_round_trip() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let caller = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let request = Request { fs_id: 1, body: RequestBody::Getattr { handle: 42, mask: 0 } };
            session.service_operation(request, long_wait())
        })
    };

    let (tag, request) = read_one(&conn);
    assert_eq!(request.op_type(), OpType::Getattr);
    let attrs = ObjectAttrs { mode: 0o644, size: 4096, objtype: 1, ..Default::default() };
    write_one(
        &conn,
        tag,
        &Response { status: 0, body: ResponseBody::Getattr { attrs, link_target: None } },
        None,
    );

    let (response, trailer) = caller.join().unwrap().expect("caller should see attributes");
    assert!(trailer.is_none());
    match response.body {
        ResponseBody::Getattr { attrs, .. } => assert_eq!(attrs.size, 4096),
        other => panic!("unexpected body: {other:?}"),
    }
}

#[test]
fn test_readdir_carries_trailer() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let caller = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let request = Request {
                fs_id: 1,
                body: RequestBody::Readdir { handle: 7, token: 0, max_entries: 32 },
            };
            session.service_operation(request, long_wait())
        })
    };

    let (tag, _) = read_one(&conn);
    let page = DirentPage {
        entries: vec![
            WireDirent { handle: 100, objtype: 2, name: "docs".to_string() },
            WireDirent { handle: 101, objtype: 1, name: "notes.txt".to_string() },
        ],
    };
    let trailer = page.encode().unwrap();
    write_one(
        &conn,
        tag,
        &Response { status: 0, body: ResponseBody::Readdir { token: 2, entry_count: 2 } },
        Some(&trailer),
    );

    let (_, trailer) = caller.join().unwrap().expect("readdir should succeed");
    let decoded = DirentPage::decode(&trailer.expect("trailer expected")).unwrap();
    assert_eq!(decoded.entries.len(), 2);
    assert_eq!(decoded.entries[0].name, "docs");
}

#[test]
fn test_readdir_with_zero_trailer_fails_operation() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let caller = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let request = Request {
                fs_id: 1,
                body: RequestBody::Readdir { handle: 7, token: 0, max_entries: 32 },
            };
            session.service_operation(request, long_wait())
        })
    };

    let (tag, _) = read_one(&conn);
    // Declares DirectoryRead but carries no trailer: rejected before the
    // response is considered valid.
    write_one(
        &conn,
        tag,
        &Response { status: 0, body: ResponseBody::Readdir { token: 0, entry_count: 0 } },
        None,
    );

    assert_eq!(caller.join().unwrap(), Err(OpError::Failed(-libc::EIO)));
}

#[test]
fn test_session_loss_purges_queued_operations() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let mut callers = Vec::new();
    for handle in [1u64, 2] {
        let session = Arc::clone(&session);
        callers.push(thread::spawn(move || {
            let request = Request { fs_id: 1, body: RequestBody::Fsync { handle } };
            session.service_operation(request, long_wait())
        }));
    }
    while session.waiting_len() < 2 {
        thread::yield_now();
    }

    // Daemon dies before dispatching either operation.
    drop(conn);

    for caller in callers {
        assert_eq!(caller.join().unwrap(), Err(OpError::TimedOut));
    }
    assert_eq!(session.waiting_len(), 0);
    assert_eq!(session.inflight_len(), 0);
    assert!(!session.is_client_connected());
}

#[test]
fn test_stale_tag_write_is_consumed_noop() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let caller = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let request = Request { fs_id: 1, body: RequestBody::Fsync { handle: 1 } };
            session.service_operation(request, long_wait())
        })
    };

    let (tag, _) = read_one(&conn);
    // Tag 0 was never allocated, let alone dispatched.
    write_one(&conn, 0, &Response { status: 0, body: ResponseBody::Fsync }, None);
    // The real operation is untouched and still answerable.
    assert_eq!(session.inflight_len(), 1);
    write_one(&conn, tag, &Response { status: 0, body: ResponseBody::Fsync }, None);

    assert!(caller.join().unwrap().is_ok());
}

#[test]
fn test_tags_unique_across_concurrent_operations() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let mut callers = Vec::new();
    for handle in 0..8u64 {
        let session = Arc::clone(&session);
        callers.push(thread::spawn(move || {
            let request = Request { fs_id: 1, body: RequestBody::Fsync { handle } };
            session.service_operation(request, long_wait())
        }));
    }

    let mut tags = HashSet::new();
    for _ in 0..8 {
        let (tag, _) = read_one(&conn);
        assert!(tags.insert(tag), "tag {tag} dispatched twice");
        write_one(&conn, tag, &Response { status: 0, body: ResponseBody::Fsync }, None);
    }
    for caller in callers {
        assert!(caller.join().unwrap().is_ok());
    }
}

#[test]
fn test_daemon_failure_status_reaches_caller() {
    let session = Session::new(ProtocolConfig::default());
    let conn = session.open_device(true).unwrap();

    let caller = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let request = Request {
                fs_id: 1,
                body: RequestBody::Lookup { parent: 1, name: "missing".to_string() },
            };
            session.service_operation(request, long_wait())
        })
    };

    let (tag, _) = read_one(&conn);
    write_one(
        &conn,
        tag,
        &Response { status: -libc::ENOENT, body: ResponseBody::Lookup { handle: 0 } },
        None,
    );

    assert_eq!(caller.join().unwrap(), Err(OpError::Failed(-libc::ENOENT)));
}

#[test]
fn test_replacement_daemon_resumes_after_crash() {
    let session = Session::new(ProtocolConfig::default());
    session.mounts().register(5, "server=alpha");

    let conn = session.open_device(true).unwrap();
    drop(conn); // crash

    assert!(session.mounts().is_pending(5));

    // Replacement daemon attaches and runs the remount sequence.
    let conn = session.open_device(true).unwrap();
    let reply = conn.control(relayfs_core::ControlRequest::RemountAll).unwrap();
    assert_eq!(reply, relayfs_core::ControlReply::RemountsQueued(1));

    let (tag, request) = read_one(&conn);
    assert_eq!(request.op_type(), OpType::FsMount);
    write_one(
        &conn,
        tag,
        &Response {
            status: 0,
            body: ResponseBody::FsMount { fs_id: 5, root_handle: 1, id: 9 },
        },
        None,
    );
    assert!(!session.mounts().is_pending(5));
}
