//! 9P protocol message definitions and encoding/decoding
//!
//! This module implements the wire format for 9P2000, 9P2000.u and 9P2000.L.
//! See <https://9p.io/sys/man/5/intro> and
//! <https://github.com/chaos/diod/blob/master/protocol.md>
//!
//! Every message is a struct, collected into the [`Fcall`] enum; encoding and
//! decoding are single exhaustive matches over it. All integers are
//! little-endian on the wire. Fields that exist only under the Unix/Linux
//! extensions (the `.u` numeric ids in `Tattach` and `Rerror`, the extension
//! tail of the legacy stat) are emitted and parsed only when the negotiated
//! [`ProtoVersion`] carries those extensions.
//!
//! Decoding borrows strings and data blobs out of the receive buffer rather
//! than copying; callers that outlive the buffer clone what they keep.

use alloc::vec::Vec;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Error;
use crate::pdu::Pdu;

/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// Special uid which `Tauth`/`Tattach` use as `n_uname` when no numeric uid
/// is supplied
pub const NONUNAME: u32 = !0;

/// Room for a `Twrite`/`Rread` header
///
/// size[4] Tread/Twrite[1] tag[2] fid[4] offset[8] count[4], rounded up
pub const IOHDRSZ: u32 = 24;

/// Room for a readdir header
pub const READDIRHDRSZ: u32 = 24;

/// Maximum path elements in a single walk
pub const MAXWELEM: usize = 16;

/// The protocol variants the client speaks, ordered by capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtoVersion {
    /// 9P2000, pre-extension
    Legacy = 0,
    /// 9P2000.u
    Unix = 1,
    /// 9P2000.L
    Linux = 2,
}

impl ProtoVersion {
    /// The version string sent in `Tversion`.
    pub fn wire_name(self) -> &'static str {
        match self {
            ProtoVersion::Legacy => "9P2000",
            ProtoVersion::Unix => "9P2000.u",
            ProtoVersion::Linux => "9P2000.L",
        }
    }

    /// Interpret the version string a server echoed in `Rversion`.
    ///
    /// Anything beginning with `9P2000` that is not one of the extension
    /// names is the legacy protocol; anything else is unintelligible.
    pub fn from_wire(s: &[u8]) -> Option<ProtoVersion> {
        if s.starts_with(b"9P2000.L") {
            Some(ProtoVersion::Linux)
        } else if s.starts_with(b"9P2000.u") {
            Some(ProtoVersion::Unix)
        } else if s.starts_with(b"9P2000") {
            Some(ProtoVersion::Legacy)
        } else {
            None
        }
    }

    /// Interpret a `version=` mount option value.
    pub fn from_option(s: &str) -> Option<ProtoVersion> {
        match s {
            "9p2000" => Some(ProtoVersion::Legacy),
            "9p2000.u" => Some(ProtoVersion::Unix),
            "9p2000.L" => Some(ProtoVersion::Linux),
            _ => None,
        }
    }

    /// Whether the `?`-guarded wire fields are present for this version.
    pub fn has_unix_extensions(self) -> bool {
        matches!(self, ProtoVersion::Unix | ProtoVersion::Linux)
    }

    pub fn is_dotl(self) -> bool {
        self == ProtoVersion::Linux
    }

    pub fn is_dotu(self) -> bool {
        self == ProtoVersion::Unix
    }
}

/// 9P message types, with the standard numeric assignments
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgType {
    // 9P2000.L
    Rlerror = 7,
    Tstatfs = 8,
    Rstatfs = 9,
    Tlopen = 12,
    Rlopen = 13,
    Tlcreate = 14,
    Rlcreate = 15,
    Tsymlink = 16,
    Rsymlink = 17,
    Tmknod = 18,
    Rmknod = 19,
    Trename = 20,
    Rrename = 21,
    Treadlink = 22,
    Rreadlink = 23,
    Tgetattr = 24,
    Rgetattr = 25,
    Tsetattr = 26,
    Rsetattr = 27,
    Txattrwalk = 30,
    Rxattrwalk = 31,
    Txattrcreate = 32,
    Rxattrcreate = 33,
    Treaddir = 40,
    Rreaddir = 41,
    Tfsync = 50,
    Rfsync = 51,
    Tlock = 52,
    Rlock = 53,
    Tgetlock = 54,
    Rgetlock = 55,
    Tlink = 70,
    Rlink = 71,
    Tmkdir = 72,
    Rmkdir = 73,
    Trenameat = 74,
    Rrenameat = 75,
    Tunlinkat = 76,
    Runlinkat = 77,

    // 9P2000
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

bitflags! {
    /// Flags passed to Tlopen/Tlcreate.
    ///
    /// Same as Linux's open flags.
    /// <https://elixir.bootlin.com/linux/v6.12/source/include/net/9p/9p.h#L263>
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LOpenFlags: u32 {
        const O_RDONLY    = 0;
        const O_WRONLY    = 1;
        const O_RDWR      = 2;

        const O_CREAT     = 0o100;
        const O_EXCL      = 0o200;
        const O_NOCTTY    = 0o400;
        const O_TRUNC     = 0o1000;
        const O_APPEND    = 0o2000;
        const O_NONBLOCK  = 0o4000;
        const O_DSYNC     = 0o10000;
        const FASYNC      = 0o20000;
        const O_DIRECT    = 0o40000;
        const O_LARGEFILE = 0o100000;
        const O_DIRECTORY = 0o200000;
        const O_NOFOLLOW  = 0o400000;
        const O_NOATIME   = 0o1000000;
        const O_CLOEXEC   = 0o2000000;
        const O_SYNC      = 0o4000000;
    }
}

bitflags! {
    /// Legacy open mode byte for Topen/Tcreate
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const OREAD   = 0x00;
        const OWRITE  = 0x01;
        const ORDWR   = 0x02;
        const OEXEC   = 0x03;
        const OTRUNC  = 0x10;
        const ORCLOSE = 0x40;
    }
}

bitflags! {
    /// Legacy permission bits for Tcreate and the stat mode field
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Perm: u32 {
        const DMDIR       = 0x8000_0000;
        const DMAPPEND    = 0x4000_0000;
        const DMEXCL      = 0x2000_0000;
        const DMMOUNT     = 0x1000_0000;
        const DMAUTH      = 0x0800_0000;
        const DMTMP       = 0x0400_0000;
        // 9P2000.u extensions
        const DMSYMLINK   = 0x0200_0000;
        const DMLINK      = 0x0100_0000;
        const DMDEVICE    = 0x0080_0000;
        const DMNAMEDPIPE = 0x0020_0000;
        const DMSOCKET    = 0x0010_0000;
        const DMSETUID    = 0x0008_0000;
        const DMSETGID    = 0x0004_0000;
        const DMSETVTX    = 0x0001_0000;
    }
}

bitflags! {
    /// File lock type, Flock.typ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LockType: u8 {
        const RDLOCK = 0;
        const WRLOCK = 1;
        const UNLOCK = 2;
    }
}

bitflags! {
    /// File lock flags, Flock.flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LockFlag: u32 {
        /// Blocking request
        const BLOCK   = 1;
        /// Reserved for future use
        const RECLAIM = 2;
    }
}

bitflags! {
    /// File lock status
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LockStatus: u8 {
        const SUCCESS = 0;
        const BLOCKED = 1;
        const ERROR   = 2;
        const GRACE   = 3;
    }
}

bitflags! {
    /// Bits in Qid.typ
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QidType: u8 {
        /// Type bit for directories
        const DIR     = 0x80;
        /// Type bit for append only files
        const APPEND  = 0x40;
        /// Type bit for exclusive use files
        const EXCL    = 0x20;
        /// Type bit for mounted channel
        const MOUNT   = 0x10;
        /// Type bit for authentication file
        const AUTH    = 0x08;
        /// Type bit for not-backed-up file
        const TMP     = 0x04;
        /// Type bit for symbolic links (9P2000.u)
        const SYMLINK = 0x02;
        /// Type bit for hard-link (9P2000.u)
        const LINK    = 0x01;
        /// Plain file
        const FILE    = 0x00;
    }
}

bitflags! {
    /// Bits in `mask` and `valid` of `Tgetattr` and `Rgetattr`.
    ///
    /// # Protocol
    /// 9P2000.L
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GetattrMask: u64 {
        const MODE         = 0x00000001;
        const NLINK        = 0x00000002;
        const UID          = 0x00000004;
        const GID          = 0x00000008;
        const RDEV         = 0x00000010;
        const ATIME        = 0x00000020;
        const MTIME        = 0x00000040;
        const CTIME        = 0x00000080;
        const INO          = 0x00000100;
        const SIZE         = 0x00000200;
        const BLOCKS       = 0x00000400;

        const BTIME        = 0x00000800;
        const GEN          = 0x00001000;
        const DATA_VERSION = 0x00002000;

        /// Mask for fields up to BLOCKS
        const BASIC        = 0x000007ff;
        /// Mask for all fields above
        const ALL          = 0x00003fff;
    }
}

bitflags! {
    /// Bits in `valid` of `Tsetattr`.
    ///
    /// If a time bit is set without the corresponding SET bit, the current
    /// system time on the server is used instead of the value sent in the
    /// request.
    ///
    /// # Protocol
    /// 9P2000.L
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SetattrMask: u32 {
        const MODE      = 0x00000001;
        const UID       = 0x00000002;
        const GID       = 0x00000004;
        const SIZE      = 0x00000008;
        const ATIME     = 0x00000010;
        const MTIME     = 0x00000020;
        const CTIME     = 0x00000040;
        const ATIME_SET = 0x00000080;
        const MTIME_SET = 0x00000100;
    }
}

/// String type used in 9P protocol messages
#[derive(Clone, Debug)]
pub enum FcallStr<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl PartialEq for FcallStr<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FcallStr<'_> {}

impl FcallStr<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FcallStr::Owned(b) => b,
            FcallStr::Borrowed(b) => b,
        }
    }

    /// Create a static (owned) copy of this string
    pub fn clone_static(&self) -> FcallStr<'static> {
        FcallStr::Owned(self.as_bytes().to_vec())
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl<'a, T: ?Sized + AsRef<[u8]>> From<&'a T> for FcallStr<'a> {
    fn from(b: &'a T) -> FcallStr<'a> {
        FcallStr::Borrowed(b.as_ref())
    }
}

/// Unique identifier for a file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

/// File system statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statfs {
    pub typ: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// Time structure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

/// File attributes returned by Rgetattr
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
    pub btime: Time,
    pub generation: u64,
    pub data_version: u64,
}

/// Attributes for Tsetattr
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
}

/// Legacy (9P2000/.u) stat structure, the `S` shape on the wire.
///
/// The four name strings and the extension are decoded as borrows into the
/// receive buffer; [`WStat::clone_static`] takes ownership. The `n_*` ids
/// exist only under the Unix extensions and default to `!0` otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WStat<'a> {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: FcallStr<'a>,
    pub uid: FcallStr<'a>,
    pub gid: FcallStr<'a>,
    pub muid: FcallStr<'a>,
    pub extension: Option<FcallStr<'a>>,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

impl WStat<'_> {
    /// The encoded size of this stat, excluding its own leading size field.
    ///
    /// size[2] is not counted; type[2] dev[4] qid[13] mode[4] atime[4]
    /// mtime[4] length[8] and the four string length prefixes are, plus the
    /// extension tail under the Unix extensions.
    pub fn wire_size(&self, proto: ProtoVersion) -> u16 {
        let mut size = 2 + 4 + 13 + 4 + 4 + 4 + 8 + 2 + 2 + 2 + 2;
        size += self.name.len() + self.uid.len() + self.gid.len() + self.muid.len();
        if proto.has_unix_extensions() {
            size += 2 + 4 + 4 + 4;
            if let Some(ext) = &self.extension {
                size += ext.len();
            }
        }
        size as u16
    }

    pub fn clone_static(&self) -> WStat<'static> {
        WStat {
            typ: self.typ,
            dev: self.dev,
            qid: self.qid,
            mode: self.mode,
            atime: self.atime,
            mtime: self.mtime,
            length: self.length,
            name: self.name.clone_static(),
            uid: self.uid.clone_static(),
            gid: self.gid.clone_static(),
            muid: self.muid.clone_static(),
            extension: self.extension.as_ref().map(FcallStr::clone_static),
            n_uid: self.n_uid,
            n_gid: self.n_gid,
            n_muid: self.n_muid,
        }
    }
}

/// Directory entry in an Rreaddir payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub qid: Qid,
    pub offset: u64,
    pub typ: u8,
    pub name: FcallStr<'a>,
}

impl DirEntry<'_> {
    /// The encoded size of this entry
    pub fn wire_size(&self) -> usize {
        13 + 8 + 1 + 2 + self.name.len()
    }

    pub fn clone_static(&self) -> DirEntry<'static> {
        DirEntry {
            qid: self.qid,
            offset: self.offset,
            typ: self.typ,
            name: self.name.clone_static(),
        }
    }
}

/// File lock request body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Flock<'a> {
    pub typ: LockType,
    pub flags: LockFlag,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: FcallStr<'a>,
}

/// Get lock request body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Getlock<'a> {
    pub typ: LockType,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: FcallStr<'a>,
}

impl Getlock<'_> {
    pub fn clone_static(&self) -> Getlock<'static> {
        Getlock {
            typ: self.typ,
            start: self.start,
            length: self.length,
            proc_id: self.proc_id,
            client_id: self.client_id.clone_static(),
        }
    }
}

// ============================================================================
// Request/response structures
// ============================================================================

/// 9P2000.L error response: a raw errno
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlerror {
    pub ecode: u32,
}

/// Legacy/9P2000.u error response: a message, plus an errno on `.u`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rerror<'a> {
    pub ename: FcallStr<'a>,
    pub errno: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tversion<'a> {
    pub msize: u32,
    pub version: FcallStr<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rversion<'a> {
    pub msize: u32,
    pub version: FcallStr<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tauth<'a> {
    pub afid: u32,
    pub uname: FcallStr<'a>,
    pub aname: FcallStr<'a>,
    pub n_uname: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rauth {
    pub aqid: Qid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tattach<'a> {
    pub fid: u32,
    pub afid: u32,
    pub uname: FcallStr<'a>,
    pub aname: FcallStr<'a>,
    pub n_uname: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rattach {
    pub qid: Qid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tflush {
    pub oldtag: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rflush {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Twalk<'a> {
    pub fid: u32,
    pub new_fid: u32,
    pub wnames: Vec<FcallStr<'a>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rwalk {
    pub wqids: Vec<Qid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topen {
    pub fid: u32,
    pub mode: OpenMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ropen {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tcreate<'a> {
    pub fid: u32,
    pub name: FcallStr<'a>,
    pub perm: u32,
    pub mode: OpenMode,
    /// 9P2000.u: symlink target or device description
    pub extension: Option<FcallStr<'a>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rcreate {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tread {
    pub fid: u32,
    pub offset: u64,
    pub count: u32,
}

/// Read response; the payload is a borrow into the receive buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rread<'a> {
    pub data: &'a [u8],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Twrite<'a> {
    pub fid: u32,
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rwrite {
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tclunk {
    pub fid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rclunk {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tremove {
    pub fid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rremove {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tstat {
    pub fid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rstat<'a> {
    pub stat: WStat<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Twstat<'a> {
    pub fid: u32,
    pub stat: WStat<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rwstat {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tstatfs {
    pub fid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rstatfs {
    pub statfs: Statfs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tlopen {
    pub fid: u32,
    pub flags: LOpenFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlopen {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlcreate<'a> {
    pub fid: u32,
    pub name: FcallStr<'a>,
    pub flags: LOpenFlags,
    pub mode: u32,
    pub gid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlcreate {
    pub qid: Qid,
    pub iounit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tsymlink<'a> {
    pub fid: u32,
    pub name: FcallStr<'a>,
    pub symtgt: FcallStr<'a>,
    pub gid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rsymlink {
    pub qid: Qid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tmknod<'a> {
    pub dfid: u32,
    pub name: FcallStr<'a>,
    pub mode: u32,
    pub major: u32,
    pub minor: u32,
    pub gid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rmknod {
    pub qid: Qid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trename<'a> {
    pub fid: u32,
    pub dfid: u32,
    pub name: FcallStr<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rrename {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Treadlink {
    pub fid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rreadlink<'a> {
    pub target: FcallStr<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tgetattr {
    pub fid: u32,
    pub req_mask: GetattrMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgetattr {
    pub valid: GetattrMask,
    pub qid: Qid,
    pub stat: Stat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tsetattr {
    pub fid: u32,
    pub valid: SetattrMask,
    pub stat: SetAttr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rsetattr {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Txattrwalk<'a> {
    pub fid: u32,
    pub new_fid: u32,
    pub name: FcallStr<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rxattrwalk {
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Txattrcreate<'a> {
    pub fid: u32,
    pub name: FcallStr<'a>,
    pub attr_size: u64,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rxattrcreate {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Treaddir {
    pub fid: u32,
    pub offset: u64,
    pub count: u32,
}

/// Readdir response; the packed entry stream is a borrow into the receive
/// buffer, re-parsed on demand with [`parse_dirent`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rreaddir<'a> {
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tfsync {
    pub fid: u32,
    pub datasync: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rfsync {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlock<'a> {
    pub fid: u32,
    pub flock: Flock<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlock {
    pub status: LockStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tgetlock<'a> {
    pub fid: u32,
    pub flock: Getlock<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rgetlock<'a> {
    pub flock: Getlock<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlink<'a> {
    pub dfid: u32,
    pub fid: u32,
    pub name: FcallStr<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlink {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tmkdir<'a> {
    pub dfid: u32,
    pub name: FcallStr<'a>,
    pub mode: u32,
    pub gid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rmkdir {
    pub qid: Qid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trenameat<'a> {
    pub olddfid: u32,
    pub oldname: FcallStr<'a>,
    pub newdfid: u32,
    pub newname: FcallStr<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rrenameat {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunlinkat<'a> {
    pub dfid: u32,
    pub name: FcallStr<'a>,
    pub flags: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Runlinkat {}

// ============================================================================
// Fcall enum
// ============================================================================

/// 9P protocol message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fcall<'a> {
    Rlerror(Rlerror),
    Rerror(Rerror<'a>),
    Tversion(Tversion<'a>),
    Rversion(Rversion<'a>),
    Tauth(Tauth<'a>),
    Rauth(Rauth),
    Tattach(Tattach<'a>),
    Rattach(Rattach),
    Tflush(Tflush),
    Rflush(Rflush),
    Twalk(Twalk<'a>),
    Rwalk(Rwalk),
    Topen(Topen),
    Ropen(Ropen),
    Tcreate(Tcreate<'a>),
    Rcreate(Rcreate),
    Tread(Tread),
    Rread(Rread<'a>),
    Twrite(Twrite<'a>),
    Rwrite(Rwrite),
    Tclunk(Tclunk),
    Rclunk(Rclunk),
    Tremove(Tremove),
    Rremove(Rremove),
    Tstat(Tstat),
    Rstat(Rstat<'a>),
    Twstat(Twstat<'a>),
    Rwstat(Rwstat),
    Tstatfs(Tstatfs),
    Rstatfs(Rstatfs),
    Tlopen(Tlopen),
    Rlopen(Rlopen),
    Tlcreate(Tlcreate<'a>),
    Rlcreate(Rlcreate),
    Tsymlink(Tsymlink<'a>),
    Rsymlink(Rsymlink),
    Tmknod(Tmknod<'a>),
    Rmknod(Rmknod),
    Trename(Trename<'a>),
    Rrename(Rrename),
    Treadlink(Treadlink),
    Rreadlink(Rreadlink<'a>),
    Tgetattr(Tgetattr),
    Rgetattr(Rgetattr),
    Tsetattr(Tsetattr),
    Rsetattr(Rsetattr),
    Txattrwalk(Txattrwalk<'a>),
    Rxattrwalk(Rxattrwalk),
    Txattrcreate(Txattrcreate<'a>),
    Rxattrcreate(Rxattrcreate),
    Treaddir(Treaddir),
    Rreaddir(Rreaddir<'a>),
    Tfsync(Tfsync),
    Rfsync(Rfsync),
    Tlock(Tlock<'a>),
    Rlock(Rlock),
    Tgetlock(Tgetlock<'a>),
    Rgetlock(Rgetlock<'a>),
    Tlink(Tlink<'a>),
    Rlink(Rlink),
    Tmkdir(Tmkdir<'a>),
    Rmkdir(Rmkdir),
    Trenameat(Trenameat<'a>),
    Rrenameat(Rrenameat),
    Tunlinkat(Tunlinkat<'a>),
    Runlinkat(Runlinkat),
}

impl Fcall<'_> {
    /// The message type byte for this message
    pub fn msg_type(&self) -> MsgType {
        match self {
            Fcall::Rlerror(_) => MsgType::Rlerror,
            Fcall::Rerror(_) => MsgType::Rerror,
            Fcall::Tversion(_) => MsgType::Tversion,
            Fcall::Rversion(_) => MsgType::Rversion,
            Fcall::Tauth(_) => MsgType::Tauth,
            Fcall::Rauth(_) => MsgType::Rauth,
            Fcall::Tattach(_) => MsgType::Tattach,
            Fcall::Rattach(_) => MsgType::Rattach,
            Fcall::Tflush(_) => MsgType::Tflush,
            Fcall::Rflush(_) => MsgType::Rflush,
            Fcall::Twalk(_) => MsgType::Twalk,
            Fcall::Rwalk(_) => MsgType::Rwalk,
            Fcall::Topen(_) => MsgType::Topen,
            Fcall::Ropen(_) => MsgType::Ropen,
            Fcall::Tcreate(_) => MsgType::Tcreate,
            Fcall::Rcreate(_) => MsgType::Rcreate,
            Fcall::Tread(_) => MsgType::Tread,
            Fcall::Rread(_) => MsgType::Rread,
            Fcall::Twrite(_) => MsgType::Twrite,
            Fcall::Rwrite(_) => MsgType::Rwrite,
            Fcall::Tclunk(_) => MsgType::Tclunk,
            Fcall::Rclunk(_) => MsgType::Rclunk,
            Fcall::Tremove(_) => MsgType::Tremove,
            Fcall::Rremove(_) => MsgType::Rremove,
            Fcall::Tstat(_) => MsgType::Tstat,
            Fcall::Rstat(_) => MsgType::Rstat,
            Fcall::Twstat(_) => MsgType::Twstat,
            Fcall::Rwstat(_) => MsgType::Rwstat,
            Fcall::Tstatfs(_) => MsgType::Tstatfs,
            Fcall::Rstatfs(_) => MsgType::Rstatfs,
            Fcall::Tlopen(_) => MsgType::Tlopen,
            Fcall::Rlopen(_) => MsgType::Rlopen,
            Fcall::Tlcreate(_) => MsgType::Tlcreate,
            Fcall::Rlcreate(_) => MsgType::Rlcreate,
            Fcall::Tsymlink(_) => MsgType::Tsymlink,
            Fcall::Rsymlink(_) => MsgType::Rsymlink,
            Fcall::Tmknod(_) => MsgType::Tmknod,
            Fcall::Rmknod(_) => MsgType::Rmknod,
            Fcall::Trename(_) => MsgType::Trename,
            Fcall::Rrename(_) => MsgType::Rrename,
            Fcall::Treadlink(_) => MsgType::Treadlink,
            Fcall::Rreadlink(_) => MsgType::Rreadlink,
            Fcall::Tgetattr(_) => MsgType::Tgetattr,
            Fcall::Rgetattr(_) => MsgType::Rgetattr,
            Fcall::Tsetattr(_) => MsgType::Tsetattr,
            Fcall::Rsetattr(_) => MsgType::Rsetattr,
            Fcall::Txattrwalk(_) => MsgType::Txattrwalk,
            Fcall::Rxattrwalk(_) => MsgType::Rxattrwalk,
            Fcall::Txattrcreate(_) => MsgType::Txattrcreate,
            Fcall::Rxattrcreate(_) => MsgType::Rxattrcreate,
            Fcall::Treaddir(_) => MsgType::Treaddir,
            Fcall::Rreaddir(_) => MsgType::Rreaddir,
            Fcall::Tfsync(_) => MsgType::Tfsync,
            Fcall::Rfsync(_) => MsgType::Rfsync,
            Fcall::Tlock(_) => MsgType::Tlock,
            Fcall::Rlock(_) => MsgType::Rlock,
            Fcall::Tgetlock(_) => MsgType::Tgetlock,
            Fcall::Rgetlock(_) => MsgType::Rgetlock,
            Fcall::Tlink(_) => MsgType::Tlink,
            Fcall::Rlink(_) => MsgType::Rlink,
            Fcall::Tmkdir(_) => MsgType::Tmkdir,
            Fcall::Rmkdir(_) => MsgType::Rmkdir,
            Fcall::Trenameat(_) => MsgType::Trenameat,
            Fcall::Rrenameat(_) => MsgType::Rrenameat,
            Fcall::Tunlinkat(_) => MsgType::Tunlinkat,
            Fcall::Runlinkat(_) => MsgType::Runlinkat,
        }
    }
}

/// Tagged 9P message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedFcall<'a> {
    pub tag: u16,
    pub fcall: Fcall<'a>,
}

impl<'a> TaggedFcall<'a> {
    /// Encode the message into `pdu`: header with a size placeholder, then
    /// the body, then the size patch.
    pub(crate) fn encode(&self, pdu: &mut Pdu, proto: ProtoVersion) -> Result<(), Error> {
        pdu.prepare(self.fcall.msg_type().into(), self.tag)?;
        encode_body(pdu, proto, &self.fcall)?;
        pdu.finalize();
        Ok(())
    }

    /// Decode a full message (header and body) from `buf`.
    pub(crate) fn decode(buf: &'a [u8], proto: ProtoVersion) -> Result<TaggedFcall<'a>, Error> {
        if buf.len() < crate::pdu::HDRSZ {
            return Err(Error::Truncated);
        }
        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if size < crate::pdu::HDRSZ || size > buf.len() {
            return Err(Error::Truncated);
        }
        let id = buf[4];
        let tag = u16::from_le_bytes(buf[5..7].try_into().unwrap());
        let mut d = Decoder {
            buf: &buf[crate::pdu::HDRSZ..size],
        };
        let fcall = d.decode_body(id, proto)?;
        Ok(TaggedFcall { tag, fcall })
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn enc_str(pdu: &mut Pdu, v: &FcallStr<'_>) -> Result<(), Error> {
    let len = v.len().min(u16::MAX as usize);
    pdu.write_u16(len as u16)?;
    pdu.write(&v.as_bytes()[..len])
}

fn enc_data(pdu: &mut Pdu, v: &[u8]) -> Result<(), Error> {
    pdu.write_u32(v.len() as u32)?;
    pdu.write(v)
}

fn enc_qid(pdu: &mut Pdu, v: &Qid) -> Result<(), Error> {
    pdu.write_u8(v.typ.bits())?;
    pdu.write_u32(v.version)?;
    pdu.write_u64(v.path)
}

fn enc_statfs(pdu: &mut Pdu, v: &Statfs) -> Result<(), Error> {
    pdu.write_u32(v.typ)?;
    pdu.write_u32(v.bsize)?;
    pdu.write_u64(v.blocks)?;
    pdu.write_u64(v.bfree)?;
    pdu.write_u64(v.bavail)?;
    pdu.write_u64(v.files)?;
    pdu.write_u64(v.ffree)?;
    pdu.write_u64(v.fsid)?;
    pdu.write_u32(v.namelen)
}

fn enc_time(pdu: &mut Pdu, v: &Time) -> Result<(), Error> {
    pdu.write_u64(v.sec)?;
    pdu.write_u64(v.nsec)
}

fn enc_stat(pdu: &mut Pdu, v: &Stat) -> Result<(), Error> {
    pdu.write_u32(v.mode)?;
    pdu.write_u32(v.uid)?;
    pdu.write_u32(v.gid)?;
    pdu.write_u64(v.nlink)?;
    pdu.write_u64(v.rdev)?;
    pdu.write_u64(v.size)?;
    pdu.write_u64(v.blksize)?;
    pdu.write_u64(v.blocks)?;
    enc_time(pdu, &v.atime)?;
    enc_time(pdu, &v.mtime)?;
    enc_time(pdu, &v.ctime)?;
    enc_time(pdu, &v.btime)?;
    pdu.write_u64(v.generation)?;
    pdu.write_u64(v.data_version)
}

fn enc_setattr(pdu: &mut Pdu, v: &SetAttr) -> Result<(), Error> {
    pdu.write_u32(v.mode)?;
    pdu.write_u32(v.uid)?;
    pdu.write_u32(v.gid)?;
    pdu.write_u64(v.size)?;
    pdu.write_u64(v.atime.sec)?;
    pdu.write_u64(v.atime.nsec)?;
    pdu.write_u64(v.mtime.sec)?;
    pdu.write_u64(v.mtime.nsec)
}

fn enc_wstat(pdu: &mut Pdu, proto: ProtoVersion, v: &WStat<'_>) -> Result<(), Error> {
    pdu.write_u16(v.wire_size(proto))?;
    pdu.write_u16(v.typ)?;
    pdu.write_u32(v.dev)?;
    enc_qid(pdu, &v.qid)?;
    pdu.write_u32(v.mode)?;
    pdu.write_u32(v.atime)?;
    pdu.write_u32(v.mtime)?;
    pdu.write_u64(v.length)?;
    enc_str(pdu, &v.name)?;
    enc_str(pdu, &v.uid)?;
    enc_str(pdu, &v.gid)?;
    enc_str(pdu, &v.muid)?;
    if proto.has_unix_extensions() {
        match &v.extension {
            Some(ext) => enc_str(pdu, ext)?,
            None => pdu.write_u16(0)?,
        }
        pdu.write_u32(v.n_uid)?;
        pdu.write_u32(v.n_gid)?;
        pdu.write_u32(v.n_muid)?;
    }
    Ok(())
}

fn enc_flock(pdu: &mut Pdu, v: &Flock<'_>) -> Result<(), Error> {
    pdu.write_u8(v.typ.bits())?;
    pdu.write_u32(v.flags.bits())?;
    pdu.write_u64(v.start)?;
    pdu.write_u64(v.length)?;
    pdu.write_u32(v.proc_id)?;
    enc_str(pdu, &v.client_id)
}

fn enc_getlock(pdu: &mut Pdu, v: &Getlock<'_>) -> Result<(), Error> {
    pdu.write_u8(v.typ.bits())?;
    pdu.write_u64(v.start)?;
    pdu.write_u64(v.length)?;
    pdu.write_u32(v.proc_id)?;
    enc_str(pdu, &v.client_id)
}

fn encode_body(pdu: &mut Pdu, proto: ProtoVersion, fcall: &Fcall<'_>) -> Result<(), Error> {
    match fcall {
        Fcall::Rlerror(v) => pdu.write_u32(v.ecode),
        Fcall::Rerror(v) => {
            enc_str(pdu, &v.ename)?;
            if proto.has_unix_extensions() {
                pdu.write_u32(v.errno.unwrap_or(0))?;
            }
            Ok(())
        }
        Fcall::Tversion(v) => {
            pdu.write_u32(v.msize)?;
            enc_str(pdu, &v.version)
        }
        Fcall::Rversion(v) => {
            pdu.write_u32(v.msize)?;
            enc_str(pdu, &v.version)
        }
        Fcall::Tauth(v) => {
            pdu.write_u32(v.afid)?;
            enc_str(pdu, &v.uname)?;
            enc_str(pdu, &v.aname)?;
            if proto.has_unix_extensions() {
                pdu.write_u32(v.n_uname)?;
            }
            Ok(())
        }
        Fcall::Rauth(v) => enc_qid(pdu, &v.aqid),
        Fcall::Tattach(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.afid)?;
            enc_str(pdu, &v.uname)?;
            enc_str(pdu, &v.aname)?;
            if proto.has_unix_extensions() {
                pdu.write_u32(v.n_uname)?;
            }
            Ok(())
        }
        Fcall::Rattach(v) => enc_qid(pdu, &v.qid),
        Fcall::Tflush(v) => pdu.write_u16(v.oldtag),
        Fcall::Rflush(_) => Ok(()),
        Fcall::Twalk(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.new_fid)?;
            pdu.write_u16(v.wnames.len() as u16)?;
            for name in &v.wnames {
                enc_str(pdu, name)?;
            }
            Ok(())
        }
        Fcall::Rwalk(v) => {
            pdu.write_u16(v.wqids.len() as u16)?;
            for qid in &v.wqids {
                enc_qid(pdu, qid)?;
            }
            Ok(())
        }
        Fcall::Topen(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u8(v.mode.bits())
        }
        Fcall::Ropen(v) => {
            enc_qid(pdu, &v.qid)?;
            pdu.write_u32(v.iounit)
        }
        Fcall::Tcreate(v) => {
            pdu.write_u32(v.fid)?;
            enc_str(pdu, &v.name)?;
            pdu.write_u32(v.perm)?;
            pdu.write_u8(v.mode.bits())?;
            if proto.has_unix_extensions() {
                match &v.extension {
                    Some(ext) => enc_str(pdu, ext)?,
                    None => pdu.write_u16(0)?,
                }
            }
            Ok(())
        }
        Fcall::Rcreate(v) => {
            enc_qid(pdu, &v.qid)?;
            pdu.write_u32(v.iounit)
        }
        Fcall::Tread(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u64(v.offset)?;
            pdu.write_u32(v.count)
        }
        Fcall::Rread(v) => enc_data(pdu, v.data),
        Fcall::Twrite(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u64(v.offset)?;
            enc_data(pdu, v.data)
        }
        Fcall::Rwrite(v) => pdu.write_u32(v.count),
        Fcall::Tclunk(v) => pdu.write_u32(v.fid),
        Fcall::Rclunk(_) => Ok(()),
        Fcall::Tremove(v) => pdu.write_u32(v.fid),
        Fcall::Rremove(_) => Ok(()),
        Fcall::Tstat(v) => pdu.write_u32(v.fid),
        Fcall::Rstat(v) => {
            // The stat is wrapped in an outer length field.
            pdu.write_u16(v.stat.wire_size(proto) + 2)?;
            enc_wstat(pdu, proto, &v.stat)
        }
        Fcall::Twstat(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u16(v.stat.wire_size(proto) + 2)?;
            enc_wstat(pdu, proto, &v.stat)
        }
        Fcall::Rwstat(_) => Ok(()),
        Fcall::Tstatfs(v) => pdu.write_u32(v.fid),
        Fcall::Rstatfs(v) => enc_statfs(pdu, &v.statfs),
        Fcall::Tlopen(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.flags.bits())
        }
        Fcall::Rlopen(v) => {
            enc_qid(pdu, &v.qid)?;
            pdu.write_u32(v.iounit)
        }
        Fcall::Tlcreate(v) => {
            pdu.write_u32(v.fid)?;
            enc_str(pdu, &v.name)?;
            pdu.write_u32(v.flags.bits())?;
            pdu.write_u32(v.mode)?;
            pdu.write_u32(v.gid)
        }
        Fcall::Rlcreate(v) => {
            enc_qid(pdu, &v.qid)?;
            pdu.write_u32(v.iounit)
        }
        Fcall::Tsymlink(v) => {
            pdu.write_u32(v.fid)?;
            enc_str(pdu, &v.name)?;
            enc_str(pdu, &v.symtgt)?;
            pdu.write_u32(v.gid)
        }
        Fcall::Rsymlink(v) => enc_qid(pdu, &v.qid),
        Fcall::Tmknod(v) => {
            pdu.write_u32(v.dfid)?;
            enc_str(pdu, &v.name)?;
            pdu.write_u32(v.mode)?;
            pdu.write_u32(v.major)?;
            pdu.write_u32(v.minor)?;
            pdu.write_u32(v.gid)
        }
        Fcall::Rmknod(v) => enc_qid(pdu, &v.qid),
        Fcall::Trename(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.dfid)?;
            enc_str(pdu, &v.name)
        }
        Fcall::Rrename(_) => Ok(()),
        Fcall::Treadlink(v) => pdu.write_u32(v.fid),
        Fcall::Rreadlink(v) => enc_str(pdu, &v.target),
        Fcall::Tgetattr(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u64(v.req_mask.bits())
        }
        Fcall::Rgetattr(v) => {
            pdu.write_u64(v.valid.bits())?;
            enc_qid(pdu, &v.qid)?;
            enc_stat(pdu, &v.stat)
        }
        Fcall::Tsetattr(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.valid.bits())?;
            enc_setattr(pdu, &v.stat)
        }
        Fcall::Rsetattr(_) => Ok(()),
        Fcall::Txattrwalk(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.new_fid)?;
            enc_str(pdu, &v.name)
        }
        Fcall::Rxattrwalk(v) => pdu.write_u64(v.size),
        Fcall::Txattrcreate(v) => {
            pdu.write_u32(v.fid)?;
            enc_str(pdu, &v.name)?;
            pdu.write_u64(v.attr_size)?;
            pdu.write_u32(v.flags)
        }
        Fcall::Rxattrcreate(_) => Ok(()),
        Fcall::Treaddir(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u64(v.offset)?;
            pdu.write_u32(v.count)
        }
        Fcall::Rreaddir(v) => enc_data(pdu, v.data),
        Fcall::Tfsync(v) => {
            pdu.write_u32(v.fid)?;
            pdu.write_u32(v.datasync)
        }
        Fcall::Rfsync(_) => Ok(()),
        Fcall::Tlock(v) => {
            pdu.write_u32(v.fid)?;
            enc_flock(pdu, &v.flock)
        }
        Fcall::Rlock(v) => pdu.write_u8(v.status.bits()),
        Fcall::Tgetlock(v) => {
            pdu.write_u32(v.fid)?;
            enc_getlock(pdu, &v.flock)
        }
        Fcall::Rgetlock(v) => enc_getlock(pdu, &v.flock),
        Fcall::Tlink(v) => {
            pdu.write_u32(v.dfid)?;
            pdu.write_u32(v.fid)?;
            enc_str(pdu, &v.name)
        }
        Fcall::Rlink(_) => Ok(()),
        Fcall::Tmkdir(v) => {
            pdu.write_u32(v.dfid)?;
            enc_str(pdu, &v.name)?;
            pdu.write_u32(v.mode)?;
            pdu.write_u32(v.gid)
        }
        Fcall::Rmkdir(v) => enc_qid(pdu, &v.qid),
        Fcall::Trenameat(v) => {
            pdu.write_u32(v.olddfid)?;
            enc_str(pdu, &v.oldname)?;
            pdu.write_u32(v.newdfid)?;
            enc_str(pdu, &v.newname)
        }
        Fcall::Rrenameat(_) => Ok(()),
        Fcall::Tunlinkat(v) => {
            pdu.write_u32(v.dfid)?;
            enc_str(pdu, &v.name)?;
            pdu.write_u32(v.flags)
        }
        Fcall::Runlinkat(_) => Ok(()),
    }
}

// ============================================================================
// Decoding
// ============================================================================

struct Decoder<'b> {
    buf: &'b [u8],
}

impl<'b> Decoder<'b> {
    fn u8(&mut self) -> Result<u8, Error> {
        match self.buf.first() {
            Some(v) => {
                let v = *v;
                self.buf = &self.buf[1..];
                Ok(v)
            }
            None => Err(Error::Truncated),
        }
    }

    fn u16(&mut self) -> Result<u16, Error> {
        if self.buf.len() < 2 {
            return Err(Error::Truncated);
        }
        let v = u16::from_le_bytes(self.buf[0..2].try_into().unwrap());
        self.buf = &self.buf[2..];
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        if self.buf.len() < 4 {
            return Err(Error::Truncated);
        }
        let v = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
        self.buf = &self.buf[4..];
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, Error> {
        if self.buf.len() < 8 {
            return Err(Error::Truncated);
        }
        let v = u64::from_le_bytes(self.buf[0..8].try_into().unwrap());
        self.buf = &self.buf[8..];
        Ok(v)
    }

    fn str(&mut self) -> Result<FcallStr<'b>, Error> {
        let n = self.u16()? as usize;
        if self.buf.len() < n {
            return Err(Error::Truncated);
        }
        let v = FcallStr::Borrowed(&self.buf[..n]);
        self.buf = &self.buf[n..];
        Ok(v)
    }

    /// Data blob: count followed by bytes, returned as a borrow.
    ///
    /// A count beyond the end of the PDU is clamped rather than rejected;
    /// the caller decides whether the shortfall is a protocol fault.
    fn data(&mut self) -> Result<&'b [u8], Error> {
        let n = (self.u32()? as usize).min(self.buf.len());
        let v = &self.buf[..n];
        self.buf = &self.buf[n..];
        Ok(v)
    }

    fn qid(&mut self) -> Result<Qid, Error> {
        Ok(Qid {
            typ: QidType::from_bits_truncate(self.u8()?),
            version: self.u32()?,
            path: self.u64()?,
        })
    }

    fn statfs(&mut self) -> Result<Statfs, Error> {
        Ok(Statfs {
            typ: self.u32()?,
            bsize: self.u32()?,
            blocks: self.u64()?,
            bfree: self.u64()?,
            bavail: self.u64()?,
            files: self.u64()?,
            ffree: self.u64()?,
            fsid: self.u64()?,
            namelen: self.u32()?,
        })
    }

    fn time(&mut self) -> Result<Time, Error> {
        Ok(Time {
            sec: self.u64()?,
            nsec: self.u64()?,
        })
    }

    fn stat(&mut self) -> Result<Stat, Error> {
        Ok(Stat {
            mode: self.u32()?,
            uid: self.u32()?,
            gid: self.u32()?,
            nlink: self.u64()?,
            rdev: self.u64()?,
            size: self.u64()?,
            blksize: self.u64()?,
            blocks: self.u64()?,
            atime: self.time()?,
            mtime: self.time()?,
            ctime: self.time()?,
            btime: self.time()?,
            generation: self.u64()?,
            data_version: self.u64()?,
        })
    }

    fn setattr(&mut self) -> Result<SetAttr, Error> {
        Ok(SetAttr {
            mode: self.u32()?,
            uid: self.u32()?,
            gid: self.u32()?,
            size: self.u64()?,
            atime: Time {
                sec: self.u64()?,
                nsec: self.u64()?,
            },
            mtime: Time {
                sec: self.u64()?,
                nsec: self.u64()?,
            },
        })
    }

    fn wstat(&mut self, proto: ProtoVersion) -> Result<WStat<'b>, Error> {
        // Leading size field; the content describes itself, so it is not
        // needed to drive the parse.
        let _size = self.u16()?;
        let typ = self.u16()?;
        let dev = self.u32()?;
        let qid = self.qid()?;
        let mode = self.u32()?;
        let atime = self.u32()?;
        let mtime = self.u32()?;
        let length = self.u64()?;
        let name = self.str()?;
        let uid = self.str()?;
        let gid = self.str()?;
        let muid = self.str()?;
        let (extension, n_uid, n_gid, n_muid) = if proto.has_unix_extensions() {
            (Some(self.str()?), self.u32()?, self.u32()?, self.u32()?)
        } else {
            (None, !0, !0, !0)
        };
        Ok(WStat {
            typ,
            dev,
            qid,
            mode,
            atime,
            mtime,
            length,
            name,
            uid,
            gid,
            muid,
            extension,
            n_uid,
            n_gid,
            n_muid,
        })
    }

    fn flock(&mut self) -> Result<Flock<'b>, Error> {
        Ok(Flock {
            typ: LockType::from_bits_truncate(self.u8()?),
            flags: LockFlag::from_bits_truncate(self.u32()?),
            start: self.u64()?,
            length: self.u64()?,
            proc_id: self.u32()?,
            client_id: self.str()?,
        })
    }

    fn getlock(&mut self) -> Result<Getlock<'b>, Error> {
        Ok(Getlock {
            typ: LockType::from_bits_truncate(self.u8()?),
            start: self.u64()?,
            length: self.u64()?,
            proc_id: self.u32()?,
            client_id: self.str()?,
        })
    }

    fn decode_body(&mut self, id: u8, proto: ProtoVersion) -> Result<Fcall<'b>, Error> {
        let msg_type = MsgType::try_from(id).map_err(|_| Error::Protocol)?;
        let fcall = match msg_type {
            MsgType::Rlerror => Fcall::Rlerror(Rlerror { ecode: self.u32()? }),
            MsgType::Rerror => Fcall::Rerror(Rerror {
                ename: self.str()?,
                errno: if proto.has_unix_extensions() {
                    Some(self.u32()?)
                } else {
                    None
                },
            }),
            MsgType::Tversion => Fcall::Tversion(Tversion {
                msize: self.u32()?,
                version: self.str()?,
            }),
            MsgType::Rversion => Fcall::Rversion(Rversion {
                msize: self.u32()?,
                version: self.str()?,
            }),
            MsgType::Tauth => Fcall::Tauth(Tauth {
                afid: self.u32()?,
                uname: self.str()?,
                aname: self.str()?,
                n_uname: if proto.has_unix_extensions() {
                    self.u32()?
                } else {
                    NONUNAME
                },
            }),
            MsgType::Rauth => Fcall::Rauth(Rauth { aqid: self.qid()? }),
            MsgType::Tattach => Fcall::Tattach(Tattach {
                fid: self.u32()?,
                afid: self.u32()?,
                uname: self.str()?,
                aname: self.str()?,
                n_uname: if proto.has_unix_extensions() {
                    self.u32()?
                } else {
                    NONUNAME
                },
            }),
            MsgType::Rattach => Fcall::Rattach(Rattach { qid: self.qid()? }),
            MsgType::Tflush => Fcall::Tflush(Tflush {
                oldtag: self.u16()?,
            }),
            MsgType::Rflush => Fcall::Rflush(Rflush {}),
            MsgType::Twalk => Fcall::Twalk(Twalk {
                fid: self.u32()?,
                new_fid: self.u32()?,
                wnames: {
                    let len = self.u16()?;
                    let mut wnames = Vec::with_capacity(len as usize);
                    for _ in 0..len {
                        wnames.push(self.str()?);
                    }
                    wnames
                },
            }),
            MsgType::Rwalk => Fcall::Rwalk(Rwalk {
                wqids: {
                    let len = self.u16()?;
                    let mut wqids = Vec::with_capacity(len as usize);
                    for _ in 0..len {
                        wqids.push(self.qid()?);
                    }
                    wqids
                },
            }),
            MsgType::Topen => Fcall::Topen(Topen {
                fid: self.u32()?,
                mode: OpenMode::from_bits_truncate(self.u8()?),
            }),
            MsgType::Ropen => Fcall::Ropen(Ropen {
                qid: self.qid()?,
                iounit: self.u32()?,
            }),
            MsgType::Tcreate => Fcall::Tcreate(Tcreate {
                fid: self.u32()?,
                name: self.str()?,
                perm: self.u32()?,
                mode: OpenMode::from_bits_truncate(self.u8()?),
                extension: if proto.has_unix_extensions() {
                    Some(self.str()?)
                } else {
                    None
                },
            }),
            MsgType::Rcreate => Fcall::Rcreate(Rcreate {
                qid: self.qid()?,
                iounit: self.u32()?,
            }),
            MsgType::Tread => Fcall::Tread(Tread {
                fid: self.u32()?,
                offset: self.u64()?,
                count: self.u32()?,
            }),
            MsgType::Rread => Fcall::Rread(Rread { data: self.data()? }),
            MsgType::Twrite => Fcall::Twrite(Twrite {
                fid: self.u32()?,
                offset: self.u64()?,
                data: self.data()?,
            }),
            MsgType::Rwrite => Fcall::Rwrite(Rwrite { count: self.u32()? }),
            MsgType::Tclunk => Fcall::Tclunk(Tclunk { fid: self.u32()? }),
            MsgType::Rclunk => Fcall::Rclunk(Rclunk {}),
            MsgType::Tremove => Fcall::Tremove(Tremove { fid: self.u32()? }),
            MsgType::Rremove => Fcall::Rremove(Rremove {}),
            MsgType::Tstat => Fcall::Tstat(Tstat { fid: self.u32()? }),
            MsgType::Rstat => Fcall::Rstat(Rstat {
                stat: {
                    let _outer = self.u16()?;
                    self.wstat(proto)?
                },
            }),
            MsgType::Twstat => Fcall::Twstat(Twstat {
                fid: self.u32()?,
                stat: {
                    let _outer = self.u16()?;
                    self.wstat(proto)?
                },
            }),
            MsgType::Rwstat => Fcall::Rwstat(Rwstat {}),
            MsgType::Tstatfs => Fcall::Tstatfs(Tstatfs { fid: self.u32()? }),
            MsgType::Rstatfs => Fcall::Rstatfs(Rstatfs {
                statfs: self.statfs()?,
            }),
            MsgType::Tlopen => Fcall::Tlopen(Tlopen {
                fid: self.u32()?,
                flags: LOpenFlags::from_bits_truncate(self.u32()?),
            }),
            MsgType::Rlopen => Fcall::Rlopen(Rlopen {
                qid: self.qid()?,
                iounit: self.u32()?,
            }),
            MsgType::Tlcreate => Fcall::Tlcreate(Tlcreate {
                fid: self.u32()?,
                name: self.str()?,
                flags: LOpenFlags::from_bits_truncate(self.u32()?),
                mode: self.u32()?,
                gid: self.u32()?,
            }),
            MsgType::Rlcreate => Fcall::Rlcreate(Rlcreate {
                qid: self.qid()?,
                iounit: self.u32()?,
            }),
            MsgType::Tsymlink => Fcall::Tsymlink(Tsymlink {
                fid: self.u32()?,
                name: self.str()?,
                symtgt: self.str()?,
                gid: self.u32()?,
            }),
            MsgType::Rsymlink => Fcall::Rsymlink(Rsymlink { qid: self.qid()? }),
            MsgType::Tmknod => Fcall::Tmknod(Tmknod {
                dfid: self.u32()?,
                name: self.str()?,
                mode: self.u32()?,
                major: self.u32()?,
                minor: self.u32()?,
                gid: self.u32()?,
            }),
            MsgType::Rmknod => Fcall::Rmknod(Rmknod { qid: self.qid()? }),
            MsgType::Trename => Fcall::Trename(Trename {
                fid: self.u32()?,
                dfid: self.u32()?,
                name: self.str()?,
            }),
            MsgType::Rrename => Fcall::Rrename(Rrename {}),
            MsgType::Treadlink => Fcall::Treadlink(Treadlink { fid: self.u32()? }),
            MsgType::Rreadlink => Fcall::Rreadlink(Rreadlink {
                target: self.str()?,
            }),
            MsgType::Tgetattr => Fcall::Tgetattr(Tgetattr {
                fid: self.u32()?,
                req_mask: GetattrMask::from_bits_truncate(self.u64()?),
            }),
            MsgType::Rgetattr => Fcall::Rgetattr(Rgetattr {
                valid: GetattrMask::from_bits_truncate(self.u64()?),
                qid: self.qid()?,
                stat: self.stat()?,
            }),
            MsgType::Tsetattr => Fcall::Tsetattr(Tsetattr {
                fid: self.u32()?,
                valid: SetattrMask::from_bits_truncate(self.u32()?),
                stat: self.setattr()?,
            }),
            MsgType::Rsetattr => Fcall::Rsetattr(Rsetattr {}),
            MsgType::Txattrwalk => Fcall::Txattrwalk(Txattrwalk {
                fid: self.u32()?,
                new_fid: self.u32()?,
                name: self.str()?,
            }),
            MsgType::Rxattrwalk => Fcall::Rxattrwalk(Rxattrwalk { size: self.u64()? }),
            MsgType::Txattrcreate => Fcall::Txattrcreate(Txattrcreate {
                fid: self.u32()?,
                name: self.str()?,
                attr_size: self.u64()?,
                flags: self.u32()?,
            }),
            MsgType::Rxattrcreate => Fcall::Rxattrcreate(Rxattrcreate {}),
            MsgType::Treaddir => Fcall::Treaddir(Treaddir {
                fid: self.u32()?,
                offset: self.u64()?,
                count: self.u32()?,
            }),
            MsgType::Rreaddir => Fcall::Rreaddir(Rreaddir { data: self.data()? }),
            MsgType::Tfsync => Fcall::Tfsync(Tfsync {
                fid: self.u32()?,
                datasync: self.u32()?,
            }),
            MsgType::Rfsync => Fcall::Rfsync(Rfsync {}),
            MsgType::Tlock => Fcall::Tlock(Tlock {
                fid: self.u32()?,
                flock: self.flock()?,
            }),
            MsgType::Rlock => Fcall::Rlock(Rlock {
                status: LockStatus::from_bits_truncate(self.u8()?),
            }),
            MsgType::Tgetlock => Fcall::Tgetlock(Tgetlock {
                fid: self.u32()?,
                flock: self.getlock()?,
            }),
            MsgType::Rgetlock => Fcall::Rgetlock(Rgetlock {
                flock: self.getlock()?,
            }),
            MsgType::Tlink => Fcall::Tlink(Tlink {
                dfid: self.u32()?,
                fid: self.u32()?,
                name: self.str()?,
            }),
            MsgType::Rlink => Fcall::Rlink(Rlink {}),
            MsgType::Tmkdir => Fcall::Tmkdir(Tmkdir {
                dfid: self.u32()?,
                name: self.str()?,
                mode: self.u32()?,
                gid: self.u32()?,
            }),
            MsgType::Rmkdir => Fcall::Rmkdir(Rmkdir { qid: self.qid()? }),
            MsgType::Trenameat => Fcall::Trenameat(Trenameat {
                olddfid: self.u32()?,
                oldname: self.str()?,
                newdfid: self.u32()?,
                newname: self.str()?,
            }),
            MsgType::Rrenameat => Fcall::Rrenameat(Rrenameat {}),
            MsgType::Tunlinkat => Fcall::Tunlinkat(Tunlinkat {
                dfid: self.u32()?,
                name: self.str()?,
                flags: self.u32()?,
            }),
            MsgType::Runlinkat => Fcall::Runlinkat(Runlinkat {}),
        };
        Ok(fcall)
    }
}

/// Parse one directory entry out of an `Rreaddir` payload.
///
/// Returns the entry and the number of bytes consumed, so callers can walk
/// a packed stream incrementally.
pub fn parse_dirent(buf: &[u8]) -> Result<(DirEntry<'_>, usize), Error> {
    let mut d = Decoder { buf };
    let entry = DirEntry {
        qid: d.qid()?,
        offset: d.u64()?,
        typ: d.u8()?,
        name: d.str()?,
    };
    let consumed = buf.len() - d.buf.len();
    Ok((entry, consumed))
}

/// Parse one legacy stat record out of a directory read payload.
///
/// Legacy directories read as a packed sequence of stat structures; returns
/// the stat and the bytes consumed.
pub fn parse_wstat(buf: &[u8], proto: ProtoVersion) -> Result<(WStat<'_>, usize), Error> {
    let mut d = Decoder { buf };
    let stat = d.wstat(proto)?;
    let consumed = buf.len() - d.buf.len();
    Ok((stat, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Pdu;
    use alloc::vec;

    fn roundtrip(fcall: Fcall<'_>, proto: ProtoVersion) {
        let msg = TaggedFcall { tag: 42, fcall };
        let mut pdu = Pdu::with_capacity(8192);
        msg.encode(&mut pdu, proto).expect("encode");
        let decoded = TaggedFcall::decode(pdu.bytes(), proto).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn version_roundtrip() {
        roundtrip(
            Fcall::Tversion(Tversion {
                msize: 8192,
                version: "9P2000.L".into(),
            }),
            ProtoVersion::Linux,
        );
        roundtrip(
            Fcall::Rversion(Rversion {
                msize: 4096,
                version: "9P2000".into(),
            }),
            ProtoVersion::Legacy,
        );
    }

    #[test]
    fn size_field_matches_encoded_length() {
        let msg = TaggedFcall {
            tag: 7,
            fcall: Fcall::Twalk(Twalk {
                fid: 1,
                new_fid: 2,
                wnames: vec!["usr".into(), "share".into()],
            }),
        };
        let mut pdu = Pdu::with_capacity(256);
        msg.encode(&mut pdu, ProtoVersion::Linux).unwrap();
        let bytes = pdu.bytes();
        assert_eq!(
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize,
            bytes.len()
        );
        assert_eq!(bytes[4], u8::from(MsgType::Twalk));
    }

    #[test]
    fn attach_n_uname_is_version_gated() {
        let attach = |proto| {
            let msg = TaggedFcall {
                tag: 1,
                fcall: Fcall::Tattach(Tattach {
                    fid: 0,
                    afid: NOFID,
                    uname: "root".into(),
                    aname: "/srv".into(),
                    n_uname: 1000,
                }),
            };
            let mut pdu = Pdu::with_capacity(256);
            msg.encode(&mut pdu, proto).unwrap();
            pdu.bytes().len()
        };
        // The .u form carries four more bytes than the legacy form.
        assert_eq!(attach(ProtoVersion::Linux), attach(ProtoVersion::Legacy) + 4);
        assert_eq!(attach(ProtoVersion::Unix), attach(ProtoVersion::Linux));
    }

    #[test]
    fn rerror_errno_only_on_unix_versions() {
        let mut pdu = Pdu::with_capacity(256);
        let msg = TaggedFcall {
            tag: 3,
            fcall: Fcall::Rerror(Rerror {
                ename: "file not found".into(),
                errno: Some(2),
            }),
        };
        msg.encode(&mut pdu, ProtoVersion::Unix).unwrap();
        match TaggedFcall::decode(pdu.bytes(), ProtoVersion::Unix).unwrap().fcall {
            Fcall::Rerror(e) => {
                assert_eq!(e.ename.as_bytes(), b"file not found");
                assert_eq!(e.errno, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut pdu = Pdu::with_capacity(256);
        let msg = TaggedFcall {
            tag: 3,
            fcall: Fcall::Rerror(Rerror {
                ename: "file not found".into(),
                errno: None,
            }),
        };
        msg.encode(&mut pdu, ProtoVersion::Legacy).unwrap();
        match TaggedFcall::decode(pdu.bytes(), ProtoVersion::Legacy)
            .unwrap()
            .fcall
        {
            Fcall::Rerror(e) => assert_eq!(e.errno, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rread_payload_is_borrowed_not_copied() {
        let payload = [0x58u8; 64];
        let mut pdu = Pdu::with_capacity(256);
        TaggedFcall {
            tag: 9,
            fcall: Fcall::Rread(Rread { data: &payload }),
        }
        .encode(&mut pdu, ProtoVersion::Linux)
        .unwrap();

        let bytes = pdu.bytes();
        let decoded = TaggedFcall::decode(bytes, ProtoVersion::Linux).unwrap();
        match decoded.fcall {
            Fcall::Rread(r) => {
                assert_eq!(r.data, &payload);
                // The decoded slice points into the receive buffer.
                let base = bytes.as_ptr() as usize;
                let data = r.data.as_ptr() as usize;
                assert!(data >= base && data < base + bytes.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wstat_roundtrips_with_and_without_extensions() {
        let stat = WStat {
            typ: 0,
            dev: 0,
            qid: Qid {
                typ: QidType::FILE,
                version: 1,
                path: 77,
            },
            mode: 0o644,
            atime: 1111,
            mtime: 2222,
            length: 4096,
            name: "motd".into(),
            uid: "glenda".into(),
            gid: "sys".into(),
            muid: "glenda".into(),
            extension: None,
            n_uid: 1000,
            n_gid: 100,
            n_muid: 1000,
        };

        for proto in [ProtoVersion::Legacy, ProtoVersion::Unix] {
            let msg = TaggedFcall {
                tag: 5,
                fcall: Fcall::Twstat(Twstat {
                    fid: 3,
                    stat: stat.clone(),
                }),
            };
            let mut pdu = Pdu::with_capacity(512);
            msg.encode(&mut pdu, proto).unwrap();
            match TaggedFcall::decode(pdu.bytes(), proto).unwrap().fcall {
                Fcall::Twstat(got) => {
                    assert_eq!(got.stat.name.as_bytes(), b"motd");
                    assert_eq!(got.stat.length, 4096);
                    if proto.has_unix_extensions() {
                        assert_eq!(got.stat.n_uid, 1000);
                        assert_eq!(got.stat.extension, Some(FcallStr::Borrowed(b"")));
                    } else {
                        assert_eq!(got.stat.n_uid, !0);
                        assert_eq!(got.stat.extension, None);
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn wstat_wire_size_matches_encoding() {
        let stat = WStat {
            typ: 1,
            dev: 2,
            qid: Qid::default(),
            mode: 0o755,
            atime: 0,
            mtime: 0,
            length: 0,
            name: "a".into(),
            uid: "bb".into(),
            gid: "ccc".into(),
            muid: "dddd".into(),
            extension: Some("l /tmp".into()),
            n_uid: 0,
            n_gid: 0,
            n_muid: 0,
        };
        for proto in [ProtoVersion::Legacy, ProtoVersion::Unix, ProtoVersion::Linux] {
            let mut pdu = Pdu::with_capacity(512);
            enc_wstat(&mut pdu, proto, &stat).unwrap();
            // wire_size excludes the leading size field itself.
            assert_eq!(pdu.size(), stat.wire_size(proto) as usize + 2);
        }
    }

    #[test]
    fn dirent_stream_parses_incrementally() {
        let entries = [
            DirEntry {
                qid: Qid {
                    typ: QidType::DIR,
                    version: 0,
                    path: 1,
                },
                offset: 1,
                typ: 4,
                name: ".".into(),
            },
            DirEntry {
                qid: Qid {
                    typ: QidType::FILE,
                    version: 0,
                    path: 2,
                },
                offset: 2,
                typ: 8,
                name: "kernel".into(),
            },
        ];
        let mut pdu = Pdu::with_capacity(512);
        for e in &entries {
            enc_qid(&mut pdu, &e.qid).unwrap();
            pdu.write_u64(e.offset).unwrap();
            pdu.write_u8(e.typ).unwrap();
            enc_str(&mut pdu, &e.name).unwrap();
        }

        let mut buf = pdu.bytes();
        let mut seen = vec![];
        while !buf.is_empty() {
            let (entry, used) = parse_dirent(buf).unwrap();
            assert_eq!(used, entry.wire_size());
            seen.push(entry.clone_static());
            buf = &buf[used..];
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].name.as_bytes(), b"kernel");
        assert_eq!(seen[1].qid.path, 2);
    }

    #[test]
    fn legacy_directory_stream_parses_as_packed_stats() {
        // A legacy directory read returns stat records back to back.
        let names: [&str; 2] = ["bin", "motd"];
        let mut pdu = Pdu::with_capacity(1024);
        for (i, name) in names.iter().enumerate() {
            let stat = WStat {
                typ: 0,
                dev: 0,
                qid: Qid {
                    typ: QidType::FILE,
                    version: 0,
                    path: i as u64,
                },
                mode: 0o644,
                atime: 0,
                mtime: 0,
                length: 0,
                name: (*name).into(),
                uid: "sys".into(),
                gid: "sys".into(),
                muid: "sys".into(),
                extension: None,
                n_uid: 0,
                n_gid: 0,
                n_muid: 0,
            };
            enc_wstat(&mut pdu, ProtoVersion::Legacy, &stat).unwrap();
        }

        let mut buf = pdu.bytes();
        let mut parsed = alloc::vec::Vec::new();
        while !buf.is_empty() {
            let (stat, used) = parse_wstat(buf, ProtoVersion::Legacy).unwrap();
            parsed.push(stat.clone_static());
            buf = &buf[used..];
        }
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name.as_bytes(), b"bin");
        assert_eq!(parsed[1].name.as_bytes(), b"motd");
        assert_eq!(parsed[1].qid.path, 1);
    }

    #[test]
    fn getattr_roundtrip() {
        let msg = TaggedFcall {
            tag: 11,
            fcall: Fcall::Rgetattr(Rgetattr {
                valid: GetattrMask::BASIC,
                qid: Qid {
                    typ: QidType::FILE,
                    version: 3,
                    path: 200,
                },
                stat: Stat {
                    mode: 0o100644,
                    uid: 1000,
                    gid: 1000,
                    nlink: 1,
                    rdev: 0,
                    size: 512,
                    blksize: 4096,
                    blocks: 1,
                    atime: Time { sec: 10, nsec: 1 },
                    mtime: Time { sec: 20, nsec: 2 },
                    ctime: Time { sec: 30, nsec: 3 },
                    btime: Time::default(),
                    generation: 0,
                    data_version: 0,
                },
            }),
        };
        let mut pdu = Pdu::with_capacity(512);
        msg.encode(&mut pdu, ProtoVersion::Linux).unwrap();
        let got = TaggedFcall::decode(pdu.bytes(), ProtoVersion::Linux).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn truncated_buffers_are_rejected_at_every_boundary() {
        let msg = TaggedFcall {
            tag: 2,
            fcall: Fcall::Rversion(Rversion {
                msize: 8192,
                version: "9P2000.L".into(),
            }),
        };
        let mut pdu = Pdu::with_capacity(256);
        msg.encode(&mut pdu, ProtoVersion::Linux).unwrap();
        let full = pdu.bytes();

        for cut in 0..full.len() {
            let mut short = full[..cut].to_vec();
            // Make the size field honest about the truncation, otherwise the
            // outer check fires before the body parse.
            if cut >= 4 {
                let size = (cut as u32).to_le_bytes();
                short[0..4].copy_from_slice(&size);
            }
            assert!(
                TaggedFcall::decode(&short, ProtoVersion::Linux).is_err(),
                "cut at {cut} must not decode"
            );
        }
    }

    #[test]
    fn unknown_message_type_is_a_protocol_error() {
        let mut pdu = Pdu::with_capacity(64);
        pdu.prepare(250, 1).unwrap();
        pdu.finalize();
        assert_eq!(
            TaggedFcall::decode(pdu.bytes(), ProtoVersion::Linux),
            Err(Error::Protocol)
        );
    }

    #[test]
    fn version_strings() {
        assert_eq!(ProtoVersion::from_wire(b"9P2000.L"), Some(ProtoVersion::Linux));
        assert_eq!(ProtoVersion::from_wire(b"9P2000.u"), Some(ProtoVersion::Unix));
        assert_eq!(ProtoVersion::from_wire(b"9P2000"), Some(ProtoVersion::Legacy));
        assert_eq!(ProtoVersion::from_wire(b"9P1999"), None);
        assert_eq!(ProtoVersion::from_option("9p2000.L"), Some(ProtoVersion::Linux));
        assert_eq!(ProtoVersion::from_option("9P2000.L"), None);
    }
}
