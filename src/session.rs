//! Client session state
//!
//! A [`Session`] owns one connection to a 9P server: the negotiated message
//! size and protocol version, the tag and fid pools, the request table, and
//! the transport binding. Many threads may issue RPCs on one session
//! concurrently; the session serializes nothing beyond the transport's own
//! submission lock, and never holds a lock while a caller is parked waiting
//! for its reply.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{errno, errstr_to_errno, Error};
use crate::fcall::{
    Fcall, FcallStr, MsgType, ProtoVersion, Qid, TaggedFcall, Tattach, Tclunk, Tflush, Tremove,
    Tversion, Twalk, MAXWELEM, NOFID, NOTAG,
};
use crate::idpool::IdPool;
use crate::options::SessionOptions;
use crate::pdu::Pdu;
use crate::platform::RawMutexProvider;
use crate::reqtable::{Req, ReqStatus, RequestTable};
use crate::transport::Transport;
use crate::virtio::DeviceRegistry;

/// Largest tag handed out by the tag pool; `NOTAG` itself is reserved for
/// `Tversion`.
const MAX_TAG: u32 = 0xFFFE;

/// Floor on PDU buffer capacity, so the version exchange fits even when a
/// pathological `msize=` option is below the size of a `Tversion` message.
const MIN_PDU_CAPACITY: u32 = 64;

/// Connection status of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SessionStatus {
    /// Healthy; all requests admitted
    Connected = 0,
    /// Draining before unmount; only `Tclunk` is admitted
    BeginDisconnect,
    /// Terminal; every request fails
    Disconnected,
    /// Connected but wedged. Recognized for protocol parity; nothing in
    /// this crate enters it.
    Hung,
}

/// A client-allocated handle naming a file on the server.
///
/// Fids are created by [`Session::attach`] and [`Session::walk`] and die in
/// [`Session::clunk`] or [`Session::remove`]. The session owns the live-fid
/// set; the `Arc` a caller holds is a handle into it, valid for operations
/// only while the session lives.
#[derive(Debug)]
pub struct Fid {
    id: u32,
    /// Open mode, or -1 while the fid has not been opened
    mode: AtomicI32,
    qid: spin::Mutex<Qid>,
    /// Server-advertised per-RPC payload ceiling; 0 means use
    /// `msize - IOHDRSZ`
    iounit: AtomicU32,
}

impl Fid {
    fn new(id: u32) -> Fid {
        Fid {
            id,
            mode: AtomicI32::new(-1),
            qid: spin::Mutex::new(Qid::default()),
            iounit: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn qid(&self) -> Qid {
        *self.qid.lock()
    }

    pub fn iounit(&self) -> u32 {
        self.iounit.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.mode.load(Ordering::Acquire) != -1
    }

    pub(crate) fn set_qid(&self, qid: Qid) {
        *self.qid.lock() = qid;
    }

    pub(crate) fn set_open(&self, mode: i32, iounit: u32) {
        self.iounit.store(iounit, Ordering::Release);
        self.mode.store(mode, Ordering::Release);
    }
}

/// One 9P connection.
pub struct Session<P: RawMutexProvider + 'static> {
    transport: Arc<dyn Transport<P>>,
    msize: AtomicU32,
    proto: AtomicU8,
    status: AtomicU8,
    /// Transaction ids; tag 0 is reserved at construction
    tag_pool: IdPool,
    fid_pool: IdPool,
    reqs: RequestTable<P>,
    fids: spin::Mutex<HashMap<u32, Arc<Fid>>>,
    /// Client name, used as the lock owner id and in diagnostics
    client_name: String,
}

impl<P: RawMutexProvider + 'static> Session<P> {
    /// Open a session on the device whose mount tag is `devname`.
    ///
    /// Binds the transport, applies the mount options and negotiates the
    /// protocol version. On failure the binding is released.
    pub fn new(
        platform: &'static P,
        registry: &DeviceRegistry<P>,
        devname: &str,
        options: &str,
    ) -> Result<Session<P>, Error> {
        let opts = SessionOptions::parse(options)?;
        let transport = registry.bind(devname)?;
        Session::connect(platform, transport, devname, opts)
    }

    pub(crate) fn connect(
        platform: &'static P,
        transport: Arc<dyn Transport<P>>,
        devname: &str,
        opts: SessionOptions,
    ) -> Result<Session<P>, Error> {
        let msize = opts.msize.min(transport.max_msize());
        let session = Session {
            transport,
            msize: AtomicU32::new(msize),
            proto: AtomicU8::new(opts.version.into()),
            status: AtomicU8::new(SessionStatus::Connected.into()),
            tag_pool: IdPool::with_limit(MAX_TAG),
            fid_pool: IdPool::new(),
            reqs: RequestTable::new(platform),
            fids: spin::Mutex::new(HashMap::new()),
            client_name: String::from(devname),
        };
        // Reserve tag 0.
        session.tag_pool.get();

        if let Err(err) = session.negotiate_version() {
            session.set_status(SessionStatus::Disconnected);
            session.transport.close();
            return Err(err);
        }
        Ok(session)
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    pub fn proto(&self) -> ProtoVersion {
        ProtoVersion::try_from(self.proto.load(Ordering::Acquire))
            .unwrap_or(ProtoVersion::Legacy)
    }

    pub fn is_dotl(&self) -> bool {
        self.proto().is_dotl()
    }

    pub fn is_dotu(&self) -> bool {
        self.proto().is_dotu()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::try_from(self.status.load(Ordering::Acquire))
            .unwrap_or(SessionStatus::Disconnected)
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status.into(), Ordering::Release);
    }

    /// Enter the draining state: only `Tclunk` is admitted from here on.
    pub fn begin_disconnect(&self) {
        self.set_status(SessionStatus::BeginDisconnect);
    }

    /// Sever the session. Every subsequent request fails with
    /// `ECONNABORTED`.
    pub fn disconnect(&self) {
        self.set_status(SessionStatus::Disconnected);
    }

    // ------------------------------------------------------------------
    // RPC lifecycle
    // ------------------------------------------------------------------

    /// Issue one request and wait for its reply.
    ///
    /// On success the returned [`RpcReply`] holds the reply PDU; dropping
    /// it returns the slot to idle and the tag to the pool. Every error
    /// path does the same before returning.
    pub(crate) fn rpc(&self, fcall: &Fcall<'_>) -> Result<RpcReply<'_, P>, Error> {
        let msg_type = fcall.msg_type();
        match self.status() {
            SessionStatus::Disconnected | SessionStatus::Hung => return Err(Error::Disconnected),
            SessionStatus::BeginDisconnect if msg_type != MsgType::Tclunk => {
                return Err(Error::ShuttingDown)
            }
            _ => {}
        }

        let tag = if msg_type == MsgType::Tversion {
            NOTAG
        } else {
            self.tag_pool.get().ok_or(Error::TagExhausted)? as u16
        };

        let buf_size = self.msize().max(MIN_PDU_CAPACITY);
        let req = self.reqs.alloc(tag, buf_size, buf_size);

        let encoded = req.with_bufs(|bufs| {
            let tc = bufs.tc.as_mut().ok_or(Error::Protocol)?;
            TaggedFcall {
                tag,
                fcall: fcall.clone(),
            }
            .encode(tc, self.proto())
        });
        if let Err(err) = encoded {
            self.free_req(&req);
            return Err(err);
        }
        req.set_status(ReqStatus::Unsent);

        log::debug!(">>> {msg_type:?} tag {tag}");

        if let Err(err) = self.transport.request(&req) {
            if let Error::Transport(code) = &err {
                if *code != errno::ERESTART && *code != errno::EFAULT {
                    self.set_status(SessionStatus::Disconnected);
                }
            }
            self.free_req(&req);
            return Err(err);
        }

        // Park until the worker moves the request out of Sent. The Acquire
        // load inside pairs with the worker's Release store, making the
        // reply bytes visible here.
        let mut failure = match req.wait_done() {
            Ok(ReqStatus::Error) => Some(Error::Transport(req.t_err())),
            Ok(_) => None,
            Err(_interrupted) => {
                if self.status() == SessionStatus::Connected {
                    log::debug!("interrupted, flushing tag {tag}");
                    if !self.transport.cancel(&req) {
                        let _ = self.flush(tag);
                    }
                    // The original reply may have arrived while the flush
                    // was in flight; that is a success, not an error.
                    if req.status() == ReqStatus::Received {
                        None
                    } else {
                        req.set_status(ReqStatus::Flushed);
                        Some(Error::Interrupted)
                    }
                } else {
                    Some(Error::Interrupted)
                }
            }
        };

        if failure.is_none() && req.status() == ReqStatus::Error {
            failure = Some(Error::Transport(req.t_err()));
        }
        if let Some(err) = failure {
            if let Error::Transport(code) = &err {
                if *code != errno::ERESTART && *code != errno::EFAULT {
                    self.set_status(SessionStatus::Disconnected);
                }
            }
            self.free_req(&req);
            return Err(err);
        }

        let mut rc = match req.take_rc() {
            Some(rc) => rc,
            None => {
                self.free_req(&req);
                return Err(Error::Protocol);
            }
        };
        let header = rc.parse_header();
        let reply = RpcReply {
            session: self,
            req,
            rc: Some(rc),
        };
        let (_, id, _) = header?;
        log::debug!("<<< type {id} tag {tag}");

        self.check_reply_error(&reply, id)?;
        Ok(reply)
    }

    /// Detect `Rerror`/`Rlerror` replies and map them to errnos.
    fn check_reply_error(&self, reply: &RpcReply<'_, P>, id: u8) -> Result<(), Error> {
        if id == u8::from(MsgType::Rlerror) {
            return match reply.decode()?.fcall {
                Fcall::Rlerror(e) => Err(Error::Remote(e.ecode as i32)),
                _ => Err(Error::Protocol),
            };
        }
        if id == u8::from(MsgType::Rerror) {
            return match reply.decode()?.fcall {
                Fcall::Rerror(e) => {
                    // On .u a sane numeric errno takes precedence over the
                    // message text.
                    if let Some(ecode) = e.errno {
                        if self.is_dotu() && ecode > 0 && ecode < 512 {
                            return Err(Error::Remote(ecode as i32));
                        }
                    }
                    let ename = String::from_utf8_lossy(e.ename.as_bytes()).into_owned();
                    match errstr_to_errno(&ename) {
                        0 => {
                            // Unknown strings are not failed; some servers
                            // send informational Rerrors.
                            log::warn!("unmapped server error \"{ename}\", treating as success");
                            Ok(())
                        }
                        code => Err(Error::Remote(code)),
                    }
                }
                _ => Err(Error::Protocol),
            };
        }
        Ok(())
    }

    /// Return a slot to idle and its tag to the pool.
    fn free_req(&self, req: &Req<P>) {
        self.reqs.free(req);
        let tag = req.tag();
        if tag != NOTAG && self.tag_pool.contains(tag as u32) {
            self.tag_pool.put(tag as u32);
        }
    }

    /// Cancel `oldtag` with a `Tflush` round trip.
    fn flush(&self, oldtag: u16) -> Result<(), Error> {
        log::debug!(">>> Tflush oldtag {oldtag}");
        self.rpc(&Fcall::Tflush(Tflush { oldtag })).map(drop)
    }

    // ------------------------------------------------------------------
    // Version negotiation
    // ------------------------------------------------------------------

    fn negotiate_version(&self) -> Result<(), Error> {
        let requested = self.msize();
        let ceiling = self.proto();
        log::debug!(
            ">>> Tversion msize {requested} version {}",
            ceiling.wire_name()
        );

        let reply = self.rpc(&Fcall::Tversion(Tversion {
            msize: requested,
            version: ceiling.wire_name().into(),
        }))?;
        let (msize, version) = match reply.decode()?.fcall {
            Fcall::Rversion(r) => (
                r.msize,
                ProtoVersion::from_wire(r.version.as_bytes()).ok_or(Error::Protocol)?,
            ),
            _ => return Err(Error::Protocol),
        };
        drop(reply);

        log::debug!("<<< Rversion msize {msize} version {}", version.wire_name());
        // Adopt exactly what the server echoed and the smaller msize.
        self.proto.store(version.into(), Ordering::Release);
        if msize < requested {
            self.msize.store(msize, Ordering::Release);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fid lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn fid_create(&self) -> Result<Arc<Fid>, Error> {
        let id = self.fid_pool.get().ok_or(Error::FidExhausted)?;
        let fid = Arc::new(Fid::new(id));
        self.fids.lock().insert(id, fid.clone());
        Ok(fid)
    }

    pub(crate) fn fid_destroy(&self, fid: &Fid) {
        self.fids.lock().remove(&fid.id());
        self.fid_pool.put(fid.id());
    }

    /// The number of live fids; drained during unmount.
    pub fn live_fids(&self) -> usize {
        self.fids.lock().len()
    }

    /// Establish a connection root: allocate a fid and attach it to the
    /// file tree `aname` as user `uname`.
    pub fn attach(
        &self,
        afid: Option<&Fid>,
        uname: &str,
        n_uname: u32,
        aname: &str,
    ) -> Result<Arc<Fid>, Error> {
        let fid = self.fid_create()?;
        log::debug!(">>> Tattach fid {} uname {uname} aname {aname}", fid.id());

        let qid = (|| {
            let reply = self.rpc(&Fcall::Tattach(Tattach {
                fid: fid.id(),
                afid: afid.map_or(NOFID, Fid::id),
                uname: uname.into(),
                aname: aname.into(),
                n_uname,
            }))?;
            match reply.decode()?.fcall {
                Fcall::Rattach(r) => Ok(r.qid),
                _ => Err(Error::Protocol),
            }
        })();

        match qid {
            Ok(qid) => {
                log::debug!("<<< Rattach qid {:?}", qid);
                fid.set_qid(qid);
                Ok(fid)
            }
            Err(err) => {
                self.fid_destroy(&fid);
                Err(err)
            }
        }
    }

    /// Walk `wnames` from `oldfid`.
    ///
    /// With `clone` a fresh fid is allocated for the destination, otherwise
    /// `oldfid` itself moves. The server must return one qid per name; a
    /// short reply means a missing component and maps to `ENOENT`, with no
    /// fid left allocated in the clone case. Longer paths are split into
    /// `MAXWELEM`-sized chunks.
    pub fn walk(
        &self,
        oldfid: &Arc<Fid>,
        wnames: &[&str],
        clone: bool,
    ) -> Result<Arc<Fid>, Error> {
        let fid = if clone {
            self.fid_create()?
        } else {
            oldfid.clone()
        };
        log::debug!(
            ">>> Twalk fids {},{} nwname {}",
            oldfid.id(),
            fid.id(),
            wnames.len()
        );

        let mut qids: Vec<Qid> = Vec::with_capacity(wnames.len());
        let mut src = oldfid.id();
        let mut first_chunk = true;

        let mut chunks: Vec<&[&str]> = wnames.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            // An empty walk still round-trips; it clones or refreshes the
            // fid without moving it.
            chunks.push(&[]);
        }

        for chunk in chunks {
            let result = (|| {
                let reply = self.rpc(&Fcall::Twalk(Twalk {
                    fid: src,
                    new_fid: fid.id(),
                    wnames: chunk.iter().map(|s| FcallStr::from(*s)).collect(),
                }))?;
                match reply.decode()?.fcall {
                    Fcall::Rwalk(r) => Ok(r.wqids),
                    _ => Err(Error::Protocol),
                }
            })();

            let wqids = match result {
                Ok(wqids) => wqids,
                Err(err) => {
                    if clone {
                        if first_chunk {
                            self.fid_destroy(&fid);
                        } else {
                            let _ = self.clunk(&fid);
                        }
                    }
                    return Err(err);
                }
            };

            let got = wqids.len();
            qids.extend(wqids);
            if got < chunk.len() {
                log::debug!("<<< Rwalk short: {got} of {} qids", chunk.len());
                if clone {
                    if first_chunk {
                        // The server never created the new fid.
                        self.fid_destroy(&fid);
                    } else {
                        let _ = self.clunk(&fid);
                    }
                }
                return Err(Error::NotFound);
            }

            src = fid.id();
            first_chunk = false;
        }

        match qids.last() {
            Some(last) => fid.set_qid(*last),
            None => {
                if clone {
                    fid.set_qid(oldfid.qid());
                }
            }
        }
        Ok(fid)
    }

    /// Release a fid.
    ///
    /// The fid is gone no matter what the server answers; 9P forbids reuse
    /// after clunk even on failure. A single retry happens when the round
    /// trip is interrupted.
    pub fn clunk(&self, fid: &Arc<Fid>) -> Result<(), Error> {
        let mut result = Ok(());
        for attempt in 0..2 {
            log::debug!(">>> Tclunk fid {} (try {attempt})", fid.id());
            result = self.rpc(&Fcall::Tclunk(Tclunk { fid: fid.id() })).map(drop);
            match result {
                Err(Error::Interrupted) if attempt == 0 => continue,
                _ => break,
            }
        }
        self.fid_destroy(fid);
        result
    }

    /// Remove the file the fid names and release the fid.
    ///
    /// Like clunk, the fid dies on every outcome.
    pub fn remove(&self, fid: &Arc<Fid>) -> Result<(), Error> {
        log::debug!(">>> Tremove fid {}", fid.id());
        let result = self.rpc(&Fcall::Tremove(Tremove { fid: fid.id() })).map(drop);
        match result {
            Err(Error::Interrupted) => self.clunk(fid),
            other => {
                self.fid_destroy(fid);
                other
            }
        }
    }

    /// Interrupt the caller blocked on `tag`.
    ///
    /// The hook a signal-delivery layer uses to break a thread out of an
    /// RPC wait; the interrupted call runs the `Tflush` exchange and comes
    /// back with `EINTR` unless the reply already arrived.
    pub fn interrupt_tag(&self, tag: u16) -> bool {
        match self.reqs.lookup(tag) {
            Some(req) => {
                req.interrupt();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn lookup_req(&self, tag: u16) -> Option<Arc<Req<P>>> {
        self.reqs.lookup(tag)
    }

    #[cfg(test)]
    pub(crate) fn tag_pool(&self) -> &IdPool {
        &self.tag_pool
    }
}

impl<P: RawMutexProvider + 'static> Drop for Session<P> {
    fn drop(&mut self) {
        let leftover: Vec<Arc<Fid>> = self.fids.lock().drain().map(|(_, fid)| fid).collect();
        for fid in leftover {
            log::debug!("session drop: fid {} was never clunked", fid.id());
            self.fid_pool.put(fid.id());
        }
        self.transport.close();
    }
}

/// A completed RPC: the reply PDU plus the slot lease.
///
/// Decoded views borrow from the PDU; dropping the reply returns the buffer
/// to the slot and frees slot and tag.
pub(crate) struct RpcReply<'s, P: RawMutexProvider + 'static> {
    session: &'s Session<P>,
    req: Arc<Req<P>>,
    rc: Option<Pdu>,
}

impl<P: RawMutexProvider + 'static> RpcReply<'_, P> {
    pub(crate) fn decode(&self) -> Result<TaggedFcall<'_>, Error> {
        TaggedFcall::decode(
            self.rc.as_ref().expect("reply buffer present").bytes(),
            self.session.proto(),
        )
    }
}

impl<P: RawMutexProvider + 'static> Drop for RpcReply<'_, P> {
    fn drop(&mut self) {
        if let Some(rc) = self.rc.take() {
            self.req.put_rc(rc);
        }
        self.session.free_req(&self.req);
    }
}
