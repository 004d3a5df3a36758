//! Session-level tests against a scripted in-process server, plus an
//! end-to-end run over the real virtqueue with a loopback device.

extern crate std;

use std::boxed::Box;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::vec::Vec;

use crate::error::{errno, Error};
use crate::fcall::{
    Fcall, LOpenFlags, ProtoVersion, Qid, QidType, Rattach, Rlerror, Rlopen, Rread, Rversion,
    Rwalk, TaggedFcall, NOTAG,
};
use crate::options::SessionOptions;
use crate::pdu::Pdu;
use crate::platform::mock::MockPlatform;
use crate::reqtable::{Req, ReqStatus};
use crate::session::{Session, SessionStatus};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Scripted mock transport
// ---------------------------------------------------------------------------

/// What the scripted server does with a request.
enum ServerAction {
    /// Answer the current request.
    Reply(Fcall<'static>),
    /// Park the current request; the test finishes it later (or a
    /// subsequent `Complete` does).
    Defer,
    /// Deliver a reply to a previously deferred request.
    Complete(u16, Fcall<'static>),
}

type Handler = Box<dyn FnMut(&TaggedFcall<'_>) -> Vec<ServerAction> + Send>;

/// An in-process transport that runs a scripted server inline.
///
/// Replies are produced on the submitting thread, so by the time the
/// session parks on its request slot the completion has usually already
/// landed; `Defer` exercises the genuinely asynchronous paths.
struct MockTransport {
    proto: StdMutex<ProtoVersion>,
    handler: StdMutex<Handler>,
    deferred: StdMutex<HashMap<u16, Arc<Req<MockPlatform>>>>,
    requests_seen: AtomicU32,
}

impl MockTransport {
    fn new(handler: Handler) -> MockTransport {
        MockTransport {
            proto: StdMutex::new(ProtoVersion::Linux),
            handler: StdMutex::new(handler),
            deferred: StdMutex::new(HashMap::new()),
            requests_seen: AtomicU32::new(0),
        }
    }

    fn requests_seen(&self) -> u32 {
        self.requests_seen.load(Ordering::SeqCst)
    }

    fn deliver(&self, req: &Req<MockPlatform>, tag: u16, fcall: Fcall<'static>) {
        let proto = *self.proto.lock().unwrap();
        // Track the server's own idea of the protocol across the version
        // exchange so later decodes use the negotiated form.
        if let Fcall::Rversion(Rversion { version, .. }) = &fcall {
            if let Some(new_proto) = ProtoVersion::from_wire(version.as_bytes()) {
                *self.proto.lock().unwrap() = new_proto;
            }
        }
        let mut rc = req.take_rc().expect("reply buffer available");
        TaggedFcall { tag, fcall }
            .encode(&mut rc, proto)
            .expect("server reply fits");
        req.put_rc(rc);
        req.complete(ReqStatus::Received);
    }
}

impl Transport<MockPlatform> for MockTransport {
    fn request(&self, req: &Arc<Req<MockPlatform>>) -> Result<(), Error> {
        self.requests_seen.fetch_add(1, Ordering::SeqCst);
        let proto = *self.proto.lock().unwrap();

        let (tc, rc) = req.take_bufs().expect("request buffers present");
        let msg = TaggedFcall::decode(tc.bytes(), proto).expect("client sent a valid message");
        let tag = msg.tag;
        let actions = (self.handler.lock().unwrap())(&msg);
        drop(msg);
        req.put_bufs(tc, rc);
        req.set_status(ReqStatus::Sent);

        for action in actions {
            match action {
                ServerAction::Reply(fcall) => self.deliver(req, tag, fcall),
                ServerAction::Defer => {
                    self.deferred.lock().unwrap().insert(tag, req.clone());
                }
                ServerAction::Complete(old_tag, fcall) => {
                    let old = self
                        .deferred
                        .lock()
                        .unwrap()
                        .remove(&old_tag)
                        .expect("deferred request exists");
                    self.deliver(&old, old_tag, fcall);
                }
            }
        }
        Ok(())
    }

    fn cancel(&self, _req: &Req<MockPlatform>) -> bool {
        false
    }

    fn max_msize(&self) -> u32 {
        65536
    }

    fn close(&self) {}
}

fn file_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::FILE,
        version: 1,
        path,
    }
}

fn dir_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::DIR,
        version: 1,
        path,
    }
}

fn rversion(msize: u32, version: &'static str) -> ServerAction {
    ServerAction::Reply(Fcall::Rversion(Rversion {
        msize,
        version: version.into(),
    }))
}

fn mock_session(
    options: &str,
    handler: Handler,
) -> Result<(Session<MockPlatform>, Arc<MockTransport>), Error> {
    let platform = MockPlatform::leaked();
    let transport = Arc::new(MockTransport::new(handler));
    let session = Session::connect(
        platform,
        transport.clone(),
        "testdev",
        SessionOptions::parse(options)?,
    )?;
    Ok((session, transport))
}

// ---------------------------------------------------------------------------
// Version negotiation
// ---------------------------------------------------------------------------

#[test]
fn negotiation_records_min_msize_and_echoed_version() {
    let (session, _) = mock_session(
        "msize=8192",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(v) => {
                assert_eq!(msg.tag, NOTAG);
                assert_eq!(v.msize, 8192);
                assert_eq!(v.version.as_bytes(), b"9P2000.L");
                std::vec![rversion(4096, "9P2000.L")]
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    assert_eq!(session.msize(), 4096);
    assert_eq!(session.proto(), ProtoVersion::Linux);
    assert_eq!(session.status(), SessionStatus::Connected);
}

#[test]
fn version_downgrade_gates_dotl_operations() {
    // Scenario: client asks for 9P2000.L, server only speaks 9P2000. The
    // session must record the legacy protocol and reject Tlopen before it
    // reaches the wire.
    let (session, transport) = mock_session(
        "msize=8192",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000")],
            Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rattach(Rattach {
                qid: dir_qid(100),
            }))],
            Fcall::Tlopen(_) => panic!("Tlopen must not reach a legacy server"),
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    assert_eq!(session.proto(), ProtoVersion::Legacy);
    let root = session.attach(None, "root", 0, "/srv").unwrap();

    let seen_before = transport.requests_seen();
    let err = session.lopen(&root, LOpenFlags::O_RDONLY).unwrap_err();
    assert_eq!(err, Error::NotSupported);
    assert_eq!(err.errno(), errno::EOPNOTSUPP);
    assert_eq!(transport.requests_seen(), seen_before);
}

#[test]
fn unintelligible_version_fails_the_session() {
    let result = mock_session(
        "",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P1999")],
            other => panic!("unexpected {other:?}"),
        }),
    );
    assert!(matches!(result, Err(Error::Protocol)));
}

#[test]
fn tiny_msize_still_negotiates() {
    let (session, _) = mock_session(
        "msize=24",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(v) => {
                assert_eq!(v.msize, 24);
                std::vec![rversion(24, "9P2000.L")]
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();
    assert_eq!(session.msize(), 24);
}

// ---------------------------------------------------------------------------
// Attach / walk / open / read
// ---------------------------------------------------------------------------

static FILE_CONTENT: [u8; 64] = [b'X'; 64];

fn small_fs_handler() -> Handler {
    // A one-file server: /data, 64 bytes of 'X'.
    let mut reads = 0u32;
    Box::new(move |msg| match &msg.fcall {
        Fcall::Tversion(v) => std::vec![rversion(v.msize.min(8192), "9P2000.L")],
        Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rattach(Rattach {
            qid: dir_qid(100),
        }))],
        Fcall::Twalk(w) => {
            let wqids = w.wnames.iter().map(|_| file_qid(200)).collect();
            std::vec![ServerAction::Reply(Fcall::Rwalk(Rwalk { wqids }))]
        }
        Fcall::Tlopen(_) => std::vec![ServerAction::Reply(Fcall::Rlopen(Rlopen {
            qid: file_qid(200),
            iounit: 0,
        }))],
        Fcall::Tread(r) => {
            reads += 1;
            let data: &'static [u8] = if reads == 1 {
                let take = (r.count as usize).min(FILE_CONTENT.len());
                &FILE_CONTENT[..take]
            } else {
                &[]
            };
            std::vec![ServerAction::Reply(Fcall::Rread(Rread { data }))]
        }
        Fcall::Tclunk(_) => std::vec![ServerAction::Reply(Fcall::Rclunk(crate::fcall::Rclunk {}))],
        other => panic!("unexpected {other:?}"),
    })
}

#[test]
fn attach_walk_open_read() {
    let (session, _) = mock_session("msize=8192", small_fs_handler()).unwrap();

    let root = session.attach(None, "root", 0, "/srv").unwrap();
    assert!(root.qid().typ.contains(QidType::DIR));

    let file = session.walk(&root, &["data"], true).unwrap();
    assert_eq!(file.qid().path, 200);

    session.lopen(&file, LOpenFlags::O_RDONLY).unwrap();
    assert!(file.is_open());

    // Ask for 128; the file holds 64 and the next read returns empty.
    let mut buf = [0u8; 128];
    let n = session.read(&file, 0, &mut buf).unwrap();
    assert_eq!(n, 64);
    assert_eq!(&buf[..n], &FILE_CONTENT[..]);

    session.clunk(&file).unwrap();
    session.clunk(&root).unwrap();
    assert_eq!(session.live_fids(), 0);
}

#[test]
fn request_slots_and_tags_are_released_after_each_rpc() {
    let (session, _) = mock_session("msize=8192", small_fs_handler()).unwrap();

    let root = session.attach(None, "root", 0, "/srv").unwrap();
    for _ in 0..8 {
        let fid = session.walk(&root, &[], true).unwrap();
        session.clunk(&fid).unwrap();
    }

    // Tag 0 stays reserved; every transaction tag must be back in the pool.
    for tag in 1u16..64 {
        assert!(
            !session.tag_pool().contains(u32::from(tag)),
            "tag {tag} still allocated"
        );
        if let Some(req) = session.lookup_req(tag) {
            assert_eq!(req.status(), ReqStatus::Idle);
        }
    }
}

#[test]
fn double_open_is_rejected_before_the_wire() {
    let (session, transport) = mock_session("msize=8192", small_fs_handler()).unwrap();
    let root = session.attach(None, "root", 0, "/srv").unwrap();
    let file = session.walk(&root, &["data"], true).unwrap();
    session.lopen(&file, LOpenFlags::O_RDONLY).unwrap();

    let seen = transport.requests_seen();
    assert_eq!(
        session.lopen(&file, LOpenFlags::O_RDONLY),
        Err(Error::InvalidArgument)
    );
    assert_eq!(transport.requests_seen(), seen);
}

#[test]
fn short_walk_means_enoent_and_no_fid() {
    let (session, _) = mock_session(
        "msize=8192",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000.L")],
            Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rattach(Rattach {
                qid: dir_qid(100),
            }))],
            Fcall::Twalk(w) => {
                // First component resolves, second does not.
                assert_eq!(w.wnames.len(), 2);
                std::vec![ServerAction::Reply(Fcall::Rwalk(Rwalk {
                    wqids: std::vec![dir_qid(101)],
                }))]
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let root = session.attach(None, "root", 0, "/srv").unwrap();
    let fids_before = session.live_fids();
    let err = session.walk(&root, &["sub", "missing"], true).unwrap_err();
    assert_eq!(err, Error::NotFound);
    assert_eq!(err.errno(), errno::ENOENT);
    assert_eq!(session.live_fids(), fids_before);
}

#[test]
fn empty_walk_without_clone_keeps_the_qid() {
    let (session, _) = mock_session(
        "msize=8192",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000.L")],
            Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rattach(Rattach {
                qid: dir_qid(100),
            }))],
            Fcall::Twalk(w) => {
                assert!(w.wnames.is_empty());
                std::vec![ServerAction::Reply(Fcall::Rwalk(Rwalk {
                    wqids: std::vec![],
                }))]
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let root = session.attach(None, "root", 0, "/srv").unwrap();
    let qid_before = root.qid();
    let same = session.walk(&root, &[], false).unwrap();
    assert_eq!(same.id(), root.id());
    assert_eq!(same.qid(), qid_before);
}

// ---------------------------------------------------------------------------
// Read clamping
// ---------------------------------------------------------------------------

#[test]
fn overlong_read_reply_is_clamped() {
    // Scenario: Tread asks for 8 bytes, the server replies with 12. The
    // excess must be clamped, not copied.
    static OVERLONG: [u8; 12] = *b"abcdefghijkl";
    let mut reads = 0u32;
    let (session, _) = mock_session(
        "msize=8192",
        Box::new(move |msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000.L")],
            Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rattach(Rattach {
                qid: dir_qid(100),
            }))],
            Fcall::Twalk(_) => std::vec![ServerAction::Reply(Fcall::Rwalk(Rwalk {
                wqids: std::vec![file_qid(200)],
            }))],
            Fcall::Tlopen(_) => std::vec![ServerAction::Reply(Fcall::Rlopen(Rlopen {
                qid: file_qid(200),
                iounit: 0,
            }))],
            Fcall::Tread(r) => {
                reads += 1;
                assert_eq!(r.count, 8, "client must not ask for more than the buffer");
                if reads == 1 {
                    std::vec![ServerAction::Reply(Fcall::Rread(Rread { data: &OVERLONG }))]
                } else {
                    std::vec![ServerAction::Reply(Fcall::Rread(Rread { data: &[] }))]
                }
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let root = session.attach(None, "root", 0, "/srv").unwrap();
    let file = session.walk(&root, &["data"], true).unwrap();
    session.lopen(&file, LOpenFlags::O_RDONLY).unwrap();

    let mut buf = [0u8; 8];
    let n = session.read(&file, 0, &mut buf).unwrap();
    assert_eq!(n, 8);
    assert_eq!(&buf, b"abcdefgh");
}

// ---------------------------------------------------------------------------
// Flush race
// ---------------------------------------------------------------------------

#[test]
fn reply_overtaking_flush_is_a_success() {
    // Scenario: a Tread is parked, the caller is interrupted, and the
    // server answers the original request before the Rflush. The call must
    // come back as a success carrying the data.
    let (session, transport) = mock_session(
        "msize=8192",
        Box::new(move |msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000.L")],
            Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rattach(Rattach {
                qid: dir_qid(100),
            }))],
            Fcall::Twalk(_) => std::vec![ServerAction::Reply(Fcall::Rwalk(Rwalk {
                wqids: std::vec![file_qid(200)],
            }))],
            Fcall::Tlopen(_) => std::vec![ServerAction::Reply(Fcall::Rlopen(Rlopen {
                qid: file_qid(200),
                iounit: 0,
            }))],
            Fcall::Tread(_) => std::vec![ServerAction::Defer],
            Fcall::Tflush(f) => std::vec![
                // The old reply lands first, then the flush completes.
                ServerAction::Complete(
                    f.oldtag,
                    Fcall::Rread(Rread {
                        data: &FILE_CONTENT,
                    }),
                ),
                ServerAction::Reply(Fcall::Rflush(crate::fcall::Rflush {})),
            ],
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let session = Arc::new(session);
    let root = session.attach(None, "root", 0, "/srv").unwrap();
    let file = session.walk(&root, &["data"], true).unwrap();
    session.lopen(&file, LOpenFlags::O_RDONLY).unwrap();

    let reader = {
        let session = session.clone();
        let file = file.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            session.read(&file, 0, &mut buf).map(|n| (n, buf))
        })
    };

    // Wait for the Tread to park, then interrupt the reader.
    let parked = loop {
        let deferred = transport.deferred.lock().unwrap();
        if let Some((_, req)) = deferred.iter().next() {
            break req.clone();
        }
        drop(deferred);
        std::thread::sleep(std::time::Duration::from_millis(1));
    };
    parked.interrupt();

    let (n, buf) = reader.join().unwrap().expect("read succeeds despite flush");
    assert_eq!(n, 64);
    assert_eq!(&buf[..], &FILE_CONTENT[..]);
}

// ---------------------------------------------------------------------------
// Tag exhaustion
// ---------------------------------------------------------------------------

#[test]
fn tag_exhaustion_fails_without_touching_the_transport() {
    let (session, transport) = mock_session("msize=8192", small_fs_handler()).unwrap();
    let root = session.attach(None, "root", 0, "/srv").unwrap();

    // Drain the pool completely.
    while session.tag_pool().get().is_some() {}

    let seen = transport.requests_seen();
    let err = session.walk(&root, &[], true).unwrap_err();
    assert_eq!(err, Error::TagExhausted);
    assert_eq!(err.errno(), errno::ENOMEM);
    assert_eq!(transport.requests_seen(), seen);
}

// ---------------------------------------------------------------------------
// Disconnect
// ---------------------------------------------------------------------------

#[test]
fn disconnect_fails_rpcs_but_releases_local_fid_state() {
    let (session, _) = mock_session("msize=8192", small_fs_handler()).unwrap();
    let root = session.attach(None, "root", 0, "/srv").unwrap();
    let file = session.walk(&root, &["data"], true).unwrap();
    assert_eq!(session.live_fids(), 2);

    session.disconnect();

    assert_eq!(
        session.walk(&root, &["data"], true).unwrap_err(),
        Error::Disconnected
    );

    // Clunk fails on the wire but the fid is gone locally regardless.
    assert_eq!(session.clunk(&file).unwrap_err(), Error::Disconnected);
    assert_eq!(session.live_fids(), 1);
}

#[test]
fn begin_disconnect_admits_only_clunk() {
    let (session, _) = mock_session("msize=8192", small_fs_handler()).unwrap();
    let root = session.attach(None, "root", 0, "/srv").unwrap();

    session.begin_disconnect();
    assert_eq!(
        session.walk(&root, &["data"], true).unwrap_err(),
        Error::ShuttingDown
    );
    // Draining the open fid is still allowed.
    session.clunk(&root).unwrap();
    assert_eq!(session.live_fids(), 0);
}

// ---------------------------------------------------------------------------
// Remote errors
// ---------------------------------------------------------------------------

#[test]
fn rlerror_maps_to_the_raw_errno() {
    let (session, _) = mock_session(
        "msize=8192",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000.L")],
            Fcall::Tattach(_) => std::vec![ServerAction::Reply(Fcall::Rlerror(Rlerror {
                ecode: errno::EACCES as u32,
            }))],
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let err = session.attach(None, "root", 0, "/srv").unwrap_err();
    assert_eq!(err, Error::Remote(errno::EACCES));
    // The failed attach must not leak its fid.
    assert_eq!(session.live_fids(), 0);
}

#[test]
fn legacy_rerror_maps_through_the_string_table() {
    let (session, _) = mock_session(
        "version=9p2000",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000")],
            Fcall::Tattach(_) => {
                std::vec![ServerAction::Reply(Fcall::Rerror(crate::fcall::Rerror {
                    ename: "file not found".into(),
                    errno: None,
                }))]
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let err = session.attach(None, "root", 0, "/srv").unwrap_err();
    assert_eq!(err, Error::Remote(errno::ENOENT));
}

#[test]
fn dotu_numeric_errno_takes_precedence() {
    let (session, _) = mock_session(
        "version=9p2000.u",
        Box::new(|msg| match &msg.fcall {
            Fcall::Tversion(_) => std::vec![rversion(8192, "9P2000.u")],
            Fcall::Tattach(_) => {
                std::vec![ServerAction::Reply(Fcall::Rerror(crate::fcall::Rerror {
                    // The message alone would map to ENOENT; the numeric
                    // code wins.
                    ename: "file not found".into(),
                    errno: Some(errno::EPERM as u32),
                }))]
            }
            other => panic!("unexpected {other:?}"),
        }),
    )
    .unwrap();

    let err = session.attach(None, "root", 0, "/srv").unwrap_err();
    assert_eq!(err, Error::Remote(errno::EPERM));
}

// ---------------------------------------------------------------------------
// End-to-end over the virtqueue
// ---------------------------------------------------------------------------

mod loopback {
    use super::*;
    use crate::virtio::{features, DeviceBackend, DeviceRegistry, Virtio9p};

    /// Queue geometry the loopback device captured from `setup_queue`.
    #[derive(Clone, Copy, Default)]
    struct QueueAddrs {
        desc: u64,
        avail: u64,
        used: u64,
        size: u16,
    }

    struct LoopbackState {
        addrs: StdMutex<QueueAddrs>,
        irq_pending: AtomicBool,
        stop: AtomicBool,
        kicks: AtomicU32,
    }

    /// The device side of a virtio-9p function, backed by plain memory.
    struct LoopbackBackend {
        state: Arc<LoopbackState>,
        tag: &'static str,
    }

    impl DeviceBackend for LoopbackBackend {
        fn device_features(&self) -> u64 {
            features::VIRTIO_9P_F_MOUNT_TAG | features::VIRTIO_F_RING_INDIRECT_DESC
        }

        fn ack_features(&self, _features: u64) {}

        fn set_status(&self, _status: u8) {}

        fn read_config(&self, offset: usize, buf: &mut [u8]) {
            let mut config = Vec::new();
            config.extend_from_slice(&(self.tag.len() as u16).to_le_bytes());
            config.extend_from_slice(self.tag.as_bytes());
            buf.copy_from_slice(&config[offset..offset + buf.len()]);
        }

        fn setup_queue(&self, _index: u16, size: u16, desc: u64, avail: u64, used: u64) {
            *self.state.addrs.lock().unwrap() = QueueAddrs {
                desc,
                avail,
                used,
                size,
            };
        }

        fn notify(&self, _index: u16) {
            self.state.kicks.fetch_add(1, Ordering::SeqCst);
        }

        fn ack_interrupt(&self) -> bool {
            self.state.irq_pending.swap(false, Ordering::AcqRel)
        }
    }

    const DESC_SIZE: usize = 16;
    const DESC_F_NEXT: u16 = 1;
    const DESC_F_WRITE: u16 = 2;
    const DESC_F_INDIRECT: u16 = 4;

    unsafe fn read_desc(base: u64, index: u16) -> (u64, u32, u16, u16) {
        let p = (base as usize + index as usize * DESC_SIZE) as *const u8;
        let mut raw = [0u8; DESC_SIZE];
        core::ptr::copy_nonoverlapping(p, raw.as_mut_ptr(), DESC_SIZE);
        (
            u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        )
    }

    /// The guest-visible out/in buffer pair of one request.
    unsafe fn request_buffers(addrs: &QueueAddrs, head: u16) -> ((u64, u32), (u64, u32)) {
        let (addr, _len, flags, next) = read_desc(addrs.desc, head);
        if flags & DESC_F_INDIRECT != 0 {
            let (out_addr, out_len, out_flags, _) = read_desc(addr, 0);
            assert_eq!(out_flags & DESC_F_NEXT, DESC_F_NEXT);
            let (in_addr, in_len, in_flags, _) = read_desc(addr, 1);
            assert_eq!(in_flags & DESC_F_WRITE, DESC_F_WRITE);
            ((out_addr, out_len), (in_addr, in_len))
        } else {
            let (in_addr, in_len, in_flags, _) = read_desc(addrs.desc, next);
            assert_eq!(in_flags & DESC_F_WRITE, DESC_F_WRITE);
            ((addr, _len), (in_addr, in_len))
        }
    }

    /// A tiny 9P server speaking 9P2000.L: one file `/motd`.
    fn serve(request: &[u8]) -> Vec<u8> {
        static MOTD: &[u8] = b"hello from the ring";
        let msg = TaggedFcall::decode(request, ProtoVersion::Linux).expect("valid T-message");
        let tag = msg.tag;
        let reply = match msg.fcall {
            Fcall::Tversion(v) => Fcall::Rversion(Rversion {
                msize: v.msize.min(8192),
                version: "9P2000.L".into(),
            }),
            Fcall::Tattach(_) => Fcall::Rattach(Rattach { qid: dir_qid(1) }),
            Fcall::Twalk(w) => Fcall::Rwalk(Rwalk {
                wqids: w.wnames.iter().map(|_| file_qid(2)).collect(),
            }),
            Fcall::Tlopen(_) => Fcall::Rlopen(Rlopen {
                qid: file_qid(2),
                iounit: 0,
            }),
            Fcall::Tread(r) => {
                let offset = r.offset as usize;
                let end = MOTD.len().min(offset + r.count as usize);
                Fcall::Rread(Rread {
                    data: &MOTD[offset.min(MOTD.len())..end],
                })
            }
            Fcall::Tclunk(_) => Fcall::Rclunk(crate::fcall::Rclunk {}),
            other => panic!("loopback server got {other:?}"),
        };
        let mut pdu = Pdu::with_capacity(8192);
        TaggedFcall { tag, fcall: reply }
            .encode(&mut pdu, ProtoVersion::Linux)
            .unwrap();
        pdu.bytes().to_vec()
    }

    /// Drive the device side: poll the avail ring, serve requests, fill the
    /// used ring, raise the interrupt.
    fn run_device(state: Arc<LoopbackState>, device: Arc<Virtio9p<MockPlatform>>) {
        let mut last_avail: u16 = 0;
        let mut used_count: u16 = 0;
        while !state.stop.load(Ordering::Acquire) {
            let addrs = *state.addrs.lock().unwrap();
            if addrs.size == 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            let avail_idx = unsafe {
                (*((addrs.avail as usize + 2) as *const core::sync::atomic::AtomicU16))
                    .load(Ordering::Acquire)
            };
            if avail_idx == last_avail {
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }

            while last_avail != avail_idx {
                let slot = last_avail as usize % addrs.size as usize;
                let head = unsafe {
                    core::ptr::read((addrs.avail as usize + 4 + slot * 2) as *const u16)
                };
                last_avail = last_avail.wrapping_add(1);

                let ((out_addr, out_len), (in_addr, in_len)) =
                    unsafe { request_buffers(&addrs, head) };
                let request = unsafe {
                    core::slice::from_raw_parts(out_addr as *const u8, out_len as usize)
                };
                let reply = serve(request);
                let written = reply.len().min(in_len as usize);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        reply.as_ptr(),
                        in_addr as *mut u8,
                        written,
                    );
                }

                // Publish the used element, then the index.
                let used_slot = used_count as usize % addrs.size as usize;
                unsafe {
                    let elem = (addrs.used as usize + 4 + used_slot * 8) as *mut u8;
                    core::ptr::copy_nonoverlapping(
                        (head as u32).to_le_bytes().as_ptr(),
                        elem,
                        4,
                    );
                    core::ptr::copy_nonoverlapping(
                        (written as u32).to_le_bytes().as_ptr(),
                        elem.add(4),
                        4,
                    );
                }
                used_count = used_count.wrapping_add(1);
                unsafe {
                    (*((addrs.used as usize + 2) as *const core::sync::atomic::AtomicU16))
                        .store(used_count, Ordering::Release);
                }

                state.irq_pending.store(true, Ordering::Release);
                device.on_interrupt();
            }
        }
    }

    #[test]
    fn session_runs_end_to_end_over_the_ring() {
        let platform = MockPlatform::leaked();
        let state = Arc::new(LoopbackState {
            addrs: StdMutex::new(QueueAddrs::default()),
            irq_pending: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            kicks: AtomicU32::new(0),
        });
        let backend = LoopbackBackend {
            state: state.clone(),
            tag: "shared",
        };

        let device = Virtio9p::new(platform, Box::new(backend)).unwrap();
        assert_eq!(device.mount_tag(), "shared");

        let registry = DeviceRegistry::new();
        registry.register(device.clone());

        let worker = {
            let device = device.clone();
            std::thread::spawn(move || device.run_worker())
        };
        let device_thread = {
            let state = state.clone();
            let device = device.clone();
            std::thread::spawn(move || run_device(state, device))
        };

        {
            let session = Session::new(platform, &registry, "shared", "msize=8192").unwrap();
            assert_eq!(session.proto(), ProtoVersion::Linux);
            assert_eq!(session.msize(), 8192);
            assert!(state.kicks.load(Ordering::SeqCst) > 0, "doorbell never rang");

            // A second bind while the first session lives is refused.
            assert!(matches!(
                registry.bind("shared"),
                Err(Error::Busy)
            ));
            assert!(matches!(registry.bind("absent"), Err(Error::NoDevice)));

            let root = session.attach(None, "root", 0, "/srv").unwrap();
            let file = session.walk(&root, &["motd"], true).unwrap();
            session.lopen(&file, LOpenFlags::O_RDONLY).unwrap();

            let mut buf = [0u8; 64];
            let n = session.read(&file, 0, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello from the ring");

            session.clunk(&file).unwrap();
            session.clunk(&root).unwrap();
            // Session drop releases the binding.
        }

        // The device is bindable again once the session is gone.
        let again = registry.bind("shared").expect("rebindable after close");
        drop(again);

        state.stop.store(true, Ordering::Release);
        device_thread.join().unwrap();
        device.stop();
        worker.join().unwrap();
    }

    #[test]
    fn full_ring_blocks_the_submitter_until_a_completion() {
        use crate::fcall::Tclunk;
        use crate::reqtable::RequestTable;

        let platform = MockPlatform::leaked();
        let state = Arc::new(LoopbackState {
            addrs: StdMutex::new(QueueAddrs::default()),
            irq_pending: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            kicks: AtomicU32::new(0),
        });
        let backend = LoopbackBackend {
            state: state.clone(),
            tag: "full",
        };
        let device = Virtio9p::new(platform, Box::new(backend)).unwrap();
        assert!(device.bind());

        let worker = {
            let device = device.clone();
            std::thread::spawn(move || device.run_worker())
        };

        let encode_clunk = |req: &Req<MockPlatform>, tag: u16| {
            req.with_bufs(|bufs| {
                let tc = bufs.tc.as_mut().unwrap();
                TaggedFcall {
                    tag,
                    fcall: Fcall::Tclunk(Tclunk { fid: u32::from(tag) }),
                }
                .encode(tc, ProtoVersion::Linux)
                .unwrap();
            });
        };

        // Fill the ring completely; the device is not serving yet, so
        // nothing completes. With indirect descriptors each request costs
        // one of the 128 ring slots.
        let table = RequestTable::new(platform);
        let mut reqs = Vec::new();
        for tag in 1u16..=128 {
            let req = table.alloc(tag, 256, 256);
            encode_clunk(&req, tag);
            device.request(&req).unwrap();
            reqs.push(req);
        }

        // The 129th submitter must park until a descriptor frees.
        let overflow = table.alloc(129, 256, 256);
        encode_clunk(&overflow, 129);
        let submitter = {
            let device = device.clone();
            let overflow = overflow.clone();
            std::thread::spawn(move || device.request(&overflow))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(
            !submitter.is_finished(),
            "submitter must block on a full ring"
        );

        // Let the device run; completions free descriptors and wake the
        // parked submitter.
        let device_thread = {
            let state = state.clone();
            let device = device.clone();
            std::thread::spawn(move || run_device(state, device))
        };
        submitter.join().unwrap().expect("overflow request submits");

        // Every request, including the overflow one, completes.
        for req in reqs.iter().chain(core::iter::once(&overflow)) {
            while req.status() != ReqStatus::Received {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }

        state.stop.store(true, Ordering::Release);
        device_thread.join().unwrap();
        device.stop();
        worker.join().unwrap();
    }
}

#[test]
fn wrappers_refuse_the_wrong_protocol_variant() {
    let (session, transport) = mock_session("msize=8192", small_fs_handler()).unwrap();
    let root = session.attach(None, "root", 0, "/srv").unwrap();

    // A dotl session refuses every legacy wrapper before the wire.
    let seen = transport.requests_seen();
    assert_eq!(session.getattr(&root), Err(Error::NotSupported));
    assert_eq!(
        session.open(&root, crate::fcall::OpenMode::OREAD),
        Err(Error::NotSupported)
    );
    assert_eq!(transport.requests_seen(), seen);
}
