//! Error type for 9P operations and the remote error mappings
//!
//! Two kinds of errors come back from a server: 9P2000.L replies carry a raw
//! numeric errno (`Rlerror`), while legacy and 9P2000.u replies carry an
//! error string (`Rerror`), optionally accompanied by a numeric code on `.u`.
//! String errors are translated through [`errstr_to_errno`], a dictionary of
//! the canonical Plan 9 and Linux error messages keyed by message contents.

use hashbrown::HashMap;
use thiserror::Error;

/// POSIX errno values used by the client.
///
/// These are the Linux numeric assignments; 9P2000.L servers send exactly
/// these values in `Rlerror`.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const E2BIG: i32 = 7;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const ENOTBLK: i32 = 15;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EXDEV: i32 = 18;
    pub const ENODEV: i32 = 19;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const ETXTBSY: i32 = 26;
    pub const EFBIG: i32 = 27;
    pub const ENOSPC: i32 = 28;
    pub const ESPIPE: i32 = 29;
    pub const EROFS: i32 = 30;
    pub const EMLINK: i32 = 31;
    pub const EPIPE: i32 = 32;
    pub const EDOM: i32 = 33;
    pub const ERANGE: i32 = 34;
    pub const EDEADLK: i32 = 35;
    pub const ENAMETOOLONG: i32 = 36;
    pub const ENOLCK: i32 = 37;
    pub const ENOSYS: i32 = 38;
    pub const ENOTEMPTY: i32 = 39;
    pub const ELOOP: i32 = 40;
    pub const ENOMSG: i32 = 42;
    pub const EIDRM: i32 = 43;
    pub const ENODATA: i32 = 61;
    pub const ENONET: i32 = 64;
    pub const ENOPKG: i32 = 65;
    pub const EREMOTE: i32 = 66;
    pub const ENOLINK: i32 = 67;
    pub const ECOMM: i32 = 70;
    pub const EPROTO: i32 = 71;
    pub const EBADMSG: i32 = 74;
    pub const EBADFD: i32 = 77;
    pub const ESTRPIPE: i32 = 86;
    pub const EUSERS: i32 = 87;
    pub const ENOTSOCK: i32 = 88;
    pub const EMSGSIZE: i32 = 90;
    pub const ENOPROTOOPT: i32 = 92;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const ESOCKTNOSUPPORT: i32 = 94;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EPFNOSUPPORT: i32 = 96;
    pub const ENETDOWN: i32 = 100;
    pub const ENETUNREACH: i32 = 101;
    pub const ENETRESET: i32 = 102;
    pub const ECONNABORTED: i32 = 103;
    pub const ECONNRESET: i32 = 104;
    pub const ENOBUFS: i32 = 105;
    pub const EISCONN: i32 = 106;
    pub const ENOTCONN: i32 = 107;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const EHOSTDOWN: i32 = 112;
    pub const EHOSTUNREACH: i32 = 113;
    pub const EALREADY: i32 = 114;
    pub const EINPROGRESS: i32 = 115;
    pub const EISNAM: i32 = 120;
    pub const EREMOTEIO: i32 = 121;
    pub const EDQUOT: i32 = 122;
    pub const ERESTART: i32 = 85;
}

/// Error type for 9P operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// An encode or decode step ran off the end of a PDU buffer
    #[error("PDU truncated")]
    Truncated,

    /// The peer sent something the protocol does not allow
    #[error("protocol error")]
    Protocol,

    /// The server failed the request; carries the POSIX errno
    #[error("remote error: errno {0}")]
    Remote(i32),

    /// The transport failed the request; carries the POSIX errno
    #[error("transport error: errno {0}")]
    Transport(i32),

    /// The session is disconnected
    #[error("connection aborted")]
    Disconnected,

    /// The session is draining; only clunk is accepted
    #[error("session shutting down")]
    ShuttingDown,

    /// The tag pool has no free transaction id
    #[error("out of tags")]
    TagExhausted,

    /// The fid pool has no free handle id
    #[error("out of fids")]
    FidExhausted,

    /// The caller was interrupted while waiting for a reply
    #[error("interrupted")]
    Interrupted,

    /// The operation needs a protocol extension the session did not negotiate
    #[error("operation not supported by negotiated protocol version")]
    NotSupported,

    /// Invalid argument (e.g. opening an already-open fid)
    #[error("invalid argument")]
    InvalidArgument,

    /// A walk stopped short of the requested path
    #[error("no such file or directory")]
    NotFound,

    /// The named device is already bound to another session
    #[error("device busy")]
    Busy,

    /// No device with the requested mount tag exists
    #[error("no such device")]
    NoDevice,
}

impl Error {
    /// The POSIX errno this error maps to, following the conventions the
    /// kernel's 9P client uses for the same conditions.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Truncated | Error::Protocol => errno::EPROTO,
            Error::Remote(e) | Error::Transport(e) => *e,
            Error::Disconnected => errno::ECONNABORTED,
            Error::ShuttingDown => errno::ESHUTDOWN,
            Error::TagExhausted | Error::FidExhausted => errno::ENOMEM,
            Error::Interrupted => errno::EINTR,
            Error::NotSupported => errno::EOPNOTSUPP,
            Error::InvalidArgument => errno::EINVAL,
            Error::NotFound => errno::ENOENT,
            Error::Busy => errno::EBUSY,
            Error::NoDevice => errno::ENODEV,
        }
    }
}

/// The canonical error strings servers send in legacy `Rerror` replies,
/// keyed by message contents.
///
/// The first block is the standard strerror() table; the second is the set
/// of messages known from fossil, vacfs and u9fs. Entries mapping to `0` are
/// not errors at all and the reply is treated as success.
static ERRSTR_MAP: spin::Lazy<HashMap<&'static str, i32>> = spin::Lazy::new(|| {
    use errno::*;
    HashMap::from_iter([
        ("Operation not permitted", EPERM),
        ("wstat prohibited", EPERM),
        ("No such file or directory", ENOENT),
        ("directory entry not found", ENOENT),
        ("file not found", ENOENT),
        ("Interrupted system call", EINTR),
        ("Input/output error", EIO),
        ("No such device or address", ENXIO),
        ("Argument list too long", E2BIG),
        ("Bad file descriptor", EBADF),
        ("Resource temporarily unavailable", EAGAIN),
        ("Cannot allocate memory", ENOMEM),
        ("Permission denied", EACCES),
        ("Bad address", EFAULT),
        ("Block device required", ENOTBLK),
        ("Device or resource busy", EBUSY),
        ("File exists", EEXIST),
        ("Invalid cross-device link", EXDEV),
        ("No such device", ENODEV),
        ("Not a directory", ENOTDIR),
        ("Is a directory", EISDIR),
        ("Invalid argument", EINVAL),
        ("Too many open files in system", ENFILE),
        ("Too many open files", EMFILE),
        ("Text file busy", ETXTBSY),
        ("File too large", EFBIG),
        ("No space left on device", ENOSPC),
        ("Illegal seek", ESPIPE),
        ("Read-only file system", EROFS),
        ("Too many links", EMLINK),
        ("Broken pipe", EPIPE),
        ("Numerical argument out of domain", EDOM),
        ("Numerical result out of range", ERANGE),
        ("Resource deadlock avoided", EDEADLK),
        ("File name too long", ENAMETOOLONG),
        ("No locks available", ENOLCK),
        ("Function not implemented", ENOSYS),
        ("Directory not empty", ENOTEMPTY),
        ("Too many levels of symbolic links", ELOOP),
        ("No message of desired type", ENOMSG),
        ("Identifier removed", EIDRM),
        ("No data available", ENODATA),
        ("Machine is not on the network", ENONET),
        ("Package not installed", ENOPKG),
        ("Object is remote", EREMOTE),
        ("Link has been severed", ENOLINK),
        ("Communication error on send", ECOMM),
        ("Protocol error", EPROTO),
        ("Bad message", EBADMSG),
        ("File descriptor in bad state", EBADFD),
        ("Streams pipe error", ESTRPIPE),
        ("Too many users", EUSERS),
        ("Socket operation on non-socket", ENOTSOCK),
        ("Message too long", EMSGSIZE),
        ("Protocol not available", ENOPROTOOPT),
        ("Protocol not supported", EPROTONOSUPPORT),
        ("Socket type not supported", ESOCKTNOSUPPORT),
        ("Operation not supported", EOPNOTSUPP),
        ("Protocol family not supported", EPFNOSUPPORT),
        ("Network is down", ENETDOWN),
        ("Network is unreachable", ENETUNREACH),
        ("Network dropped connection on reset", ENETRESET),
        ("Software caused connection abort", ECONNABORTED),
        ("Connection reset by peer", ECONNRESET),
        ("No buffer space available", ENOBUFS),
        ("Transport endpoint is already connected", EISCONN),
        ("Transport endpoint is not connected", ENOTCONN),
        ("Cannot send after transport endpoint shutdown", ESHUTDOWN),
        ("Connection timed out", ETIMEDOUT),
        ("Connection refused", ECONNREFUSED),
        ("Host is down", EHOSTDOWN),
        ("No route to host", EHOSTUNREACH),
        ("Operation already in progress", EALREADY),
        ("Operation now in progress", EINPROGRESS),
        ("Is a named type file", EISNAM),
        ("Remote I/O error", EREMOTEIO),
        ("Disk quota exceeded", EDQUOT),
        // errors from fossil, vacfs, and u9fs
        ("fid unknown or out of range", EBADF),
        ("permission denied", EACCES),
        ("file does not exist", ENOENT),
        ("authentication failed", ECONNREFUSED),
        ("bad offset in directory read", ESPIPE),
        ("bad use of fid", EBADF),
        ("wstat can't convert between files and directories", EPERM),
        ("directory is not empty", ENOTEMPTY),
        ("file exists", EEXIST),
        ("file already exists", EEXIST),
        ("file or directory already exists", EEXIST),
        ("fid already in use", EBADF),
        ("file in use", ETXTBSY),
        ("i/o error", EIO),
        ("file already open for I/O", ETXTBSY),
        ("illegal mode", EINVAL),
        ("illegal name", ENAMETOOLONG),
        ("not a directory", ENOTDIR),
        ("not a member of proposed group", EPERM),
        ("not owner", EACCES),
        ("only owner can change group in wstat", EACCES),
        ("read only file system", EROFS),
        ("no access to special file", EPERM),
        ("i/o count too large", EIO),
        ("unknown group", EINVAL),
        ("unknown user", EINVAL),
        ("bogus wstat buffer", EPROTO),
        ("exclusive use file already open", EAGAIN),
        ("corrupted directory entry", EIO),
        ("corrupted file entry", EIO),
        ("corrupted block label", EIO),
        ("corrupted meta data", EIO),
        ("illegal offset", EINVAL),
        ("illegal path element", ENOENT),
        ("root of file system is corrupted", EIO),
        ("corrupted super block", EIO),
        ("protocol botch", EPROTO),
        ("file system is full", ENOSPC),
        ("file is in use", EAGAIN),
        ("directory entry is not allocated", ENOENT),
        ("file is read only", EROFS),
        ("file has been removed", EIDRM),
        ("only support truncation to zero length", EPERM),
        ("cannot remove root", EPERM),
        ("file too big", EFBIG),
        ("venti i/o error", EIO),
        // these are not errors
        ("u9fs rhostsauth: no authentication required", 0),
        ("u9fs authnone: no authentication required", 0),
    ])
});

/// Translate a legacy `Rerror` string to an errno.
///
/// Returns 0 for unrecognized messages; the caller treats those as
/// success-with-warning rather than failing the request on an
/// unintelligible string.
pub fn errstr_to_errno(errstr: &str) -> i32 {
    ERRSTR_MAP.get(errstr).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_strings_map_to_errno() {
        assert_eq!(errstr_to_errno("No such file or directory"), errno::ENOENT);
        assert_eq!(errstr_to_errno("file does not exist"), errno::ENOENT);
        assert_eq!(errstr_to_errno("Permission denied"), errno::EACCES);
        assert_eq!(errstr_to_errno("protocol botch"), errno::EPROTO);
    }

    #[test]
    fn unknown_strings_map_to_zero() {
        assert_eq!(errstr_to_errno("some message no server ever sent"), 0);
        assert_eq!(errstr_to_errno(""), 0);
    }

    #[test]
    fn non_error_strings_map_to_zero() {
        assert_eq!(
            errstr_to_errno("u9fs rhostsauth: no authentication required"),
            0
        );
    }

    #[test]
    fn lookup_is_by_contents_not_identity() {
        // A string built at runtime must hit the same entry as the literal.
        let mut s = alloc::string::String::new();
        s.push_str("File ");
        s.push_str("exists");
        assert_eq!(errstr_to_errno(&s), errno::EEXIST);
    }

    #[test]
    fn error_errno_values() {
        assert_eq!(Error::Disconnected.errno(), errno::ECONNABORTED);
        assert_eq!(Error::ShuttingDown.errno(), errno::ESHUTDOWN);
        assert_eq!(Error::TagExhausted.errno(), errno::ENOMEM);
        assert_eq!(Error::Remote(errno::ENOENT).errno(), errno::ENOENT);
        assert_eq!(Error::Truncated.errno(), errno::EPROTO);
    }
}
