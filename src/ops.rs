//! Typed file system operations
//!
//! Thin wrappers over [`Session::rpc`]: validate inputs, issue the request,
//! decode the reply body, and keep fid state (open mode, iounit, qid)
//! current. Legacy (9P2000/.u) and 9P2000.L variants are separate entry
//! points; calling a variant the negotiated version does not speak fails
//! before anything reaches the wire.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::fcall::{
    parse_dirent, DirEntry, Fcall, Flock, Getlock, GetattrMask, LOpenFlags, LockStatus, OpenMode,
    Qid, Rgetattr, SetAttr, SetattrMask, Statfs, Tcreate, Tfsync, Tgetattr, Tgetlock, Tlcreate,
    Tlink, Tlock, Tlopen, Tmkdir, Tmknod, Topen, Tread, Treaddir, Treadlink, Trename, Trenameat,
    Tsetattr, Tstat, Tstatfs, Tsymlink, Tunlinkat, Twrite, Twstat, Txattrcreate, Txattrwalk,
    WStat, IOHDRSZ, READDIRHDRSZ,
};
use crate::platform::RawMutexProvider;
use crate::session::{Fid, Session};

/// `flags` bit for [`Session::unlinkat`] selecting directory removal
pub const AT_REMOVEDIR: u32 = 0x200;

impl<P: RawMutexProvider + 'static> Session<P> {
    fn require_dotl(&self) -> Result<(), Error> {
        if self.is_dotl() {
            Ok(())
        } else {
            Err(Error::NotSupported)
        }
    }

    fn require_legacy(&self) -> Result<(), Error> {
        if self.is_dotl() {
            Err(Error::NotSupported)
        } else {
            Ok(())
        }
    }

    /// Largest single-RPC payload for this fid: the advertised iounit when
    /// sane, otherwise `msize` less the I/O header.
    fn io_limit(&self, fid: &Fid, hdr: u32) -> Result<u32, Error> {
        let ceiling = self.msize().saturating_sub(hdr);
        if ceiling == 0 {
            return Err(Error::InvalidArgument);
        }
        let iounit = fid.iounit();
        Ok(if iounit == 0 || iounit > ceiling {
            ceiling
        } else {
            iounit
        })
    }

    /// File system statistics for the tree behind `fid`.
    pub fn statfs(&self, fid: &Fid) -> Result<Statfs, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tstatfs(Tstatfs { fid: fid.id() }))?;
        match reply.decode()?.fcall {
            Fcall::Rstatfs(r) => Ok(r.statfs),
            _ => Err(Error::Protocol),
        }
    }

    /// Open `fid` with a legacy mode byte.
    pub fn open(&self, fid: &Fid, mode: OpenMode) -> Result<Qid, Error> {
        self.require_legacy()?;
        if fid.is_open() {
            return Err(Error::InvalidArgument);
        }
        let reply = self.rpc(&Fcall::Topen(Topen {
            fid: fid.id(),
            mode,
        }))?;
        let (qid, iounit) = match reply.decode()?.fcall {
            Fcall::Ropen(r) => (r.qid, r.iounit),
            _ => return Err(Error::Protocol),
        };
        fid.set_qid(qid);
        fid.set_open(i32::from(mode.bits()), iounit);
        Ok(qid)
    }

    /// Open `fid` with Linux open flags (9P2000.L).
    pub fn lopen(&self, fid: &Fid, flags: LOpenFlags) -> Result<Qid, Error> {
        self.require_dotl()?;
        if fid.is_open() {
            return Err(Error::InvalidArgument);
        }
        let reply = self.rpc(&Fcall::Tlopen(Tlopen {
            fid: fid.id(),
            flags,
        }))?;
        let (qid, iounit) = match reply.decode()?.fcall {
            Fcall::Rlopen(r) => (r.qid, r.iounit),
            _ => return Err(Error::Protocol),
        };
        fid.set_qid(qid);
        fid.set_open(flags.bits() as i32, iounit);
        Ok(qid)
    }

    /// Create and open `name` under the directory `fid` (legacy).
    ///
    /// On success the fid stops naming the directory and names the new
    /// file, open with `mode`.
    pub fn create(
        &self,
        fid: &Fid,
        name: &str,
        perm: u32,
        mode: OpenMode,
        extension: Option<&str>,
    ) -> Result<Qid, Error> {
        self.require_legacy()?;
        if fid.is_open() {
            return Err(Error::InvalidArgument);
        }
        let reply = self.rpc(&Fcall::Tcreate(Tcreate {
            fid: fid.id(),
            name: name.into(),
            perm,
            mode,
            extension: extension.map(Into::into),
        }))?;
        let (qid, iounit) = match reply.decode()?.fcall {
            Fcall::Rcreate(r) => (r.qid, r.iounit),
            _ => return Err(Error::Protocol),
        };
        fid.set_qid(qid);
        fid.set_open(i32::from(mode.bits()), iounit);
        Ok(qid)
    }

    /// Create and open `name` under the directory `fid` (9P2000.L).
    pub fn lcreate(
        &self,
        fid: &Fid,
        name: &str,
        flags: LOpenFlags,
        mode: u32,
        gid: u32,
    ) -> Result<Qid, Error> {
        self.require_dotl()?;
        if fid.is_open() {
            return Err(Error::InvalidArgument);
        }
        let reply = self.rpc(&Fcall::Tlcreate(Tlcreate {
            fid: fid.id(),
            name: name.into(),
            flags,
            mode,
            gid,
        }))?;
        let (qid, iounit) = match reply.decode()?.fcall {
            Fcall::Rlcreate(r) => (r.qid, r.iounit),
            _ => return Err(Error::Protocol),
        };
        fid.set_qid(qid);
        fid.set_open(flags.bits() as i32, iounit);
        Ok(qid)
    }

    /// Read from `fid` at `offset` into `buf`.
    ///
    /// Issues as many `Tread`s as needed, each capped by the iounit and the
    /// message size. A reply shorter than requested is not an error; the
    /// loop stops at a zero-length reply (end of file) or a full buffer.
    /// A reply longer than requested is a protocol fault and is clamped.
    pub fn read(&self, fid: &Fid, mut offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        let limit = self.io_limit(fid, IOHDRSZ)?;
        let mut total = 0;
        while total < buf.len() {
            let rsize = (buf.len() - total).min(limit as usize);
            log::debug!(">>> Tread fid {} offset {offset} count {rsize}", fid.id());
            let reply = self.rpc(&Fcall::Tread(Tread {
                fid: fid.id(),
                offset,
                count: rsize as u32,
            }))?;
            let decoded = reply.decode()?;
            let data = match decoded.fcall {
                Fcall::Rread(r) => r.data,
                _ => return Err(Error::Protocol),
            };
            let mut count = data.len();
            if count > rsize {
                log::warn!("bogus Rread count ({count} > {rsize})");
                count = rsize;
            }
            if count == 0 {
                break;
            }
            buf[total..total + count].copy_from_slice(&data[..count]);
            total += count;
            offset += count as u64;
        }
        Ok(total)
    }

    /// Write `data` to `fid` at `offset`.
    ///
    /// Chunked like [`Session::read`]; a short `Rwrite` continues from
    /// where the server stopped, a zero-length one ends the loop.
    pub fn write(&self, fid: &Fid, mut offset: u64, data: &[u8]) -> Result<usize, Error> {
        let limit = self.io_limit(fid, IOHDRSZ)?;
        let mut total = 0;
        while total < data.len() {
            let rsize = (data.len() - total).min(limit as usize);
            log::debug!(">>> Twrite fid {} offset {offset} count {rsize}", fid.id());
            let reply = self.rpc(&Fcall::Twrite(Twrite {
                fid: fid.id(),
                offset,
                data: &data[total..total + rsize],
            }))?;
            let mut count = match reply.decode()?.fcall {
                Fcall::Rwrite(r) => r.count as usize,
                _ => return Err(Error::Protocol),
            };
            if count > rsize {
                log::warn!("bogus Rwrite count ({count} > {rsize})");
                count = rsize;
            }
            if count == 0 {
                break;
            }
            total += count;
            offset += count as u64;
        }
        Ok(total)
    }

    /// Flush cached writes for `fid` to stable storage.
    pub fn fsync(&self, fid: &Fid, datasync: bool) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tfsync(Tfsync {
            fid: fid.id(),
            datasync: u32::from(datasync),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rfsync(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// Read directory entries (9P2000.L) into `buf`, starting at the
    /// opaque `offset` of the previous batch's last entry.
    ///
    /// Returns the bytes filled; parse them with
    /// [`parse_dirent`](crate::fcall::parse_dirent). Legacy sessions read
    /// directories with plain [`Session::read`] and re-parse with
    /// [`parse_wstat`](crate::fcall::parse_wstat).
    pub fn readdir(&self, fid: &Fid, offset: u64, buf: &mut [u8]) -> Result<usize, Error> {
        self.require_dotl()?;
        let limit = self.io_limit(fid, READDIRHDRSZ)?;
        let count = (buf.len() as u32).min(limit);
        log::debug!(">>> Treaddir fid {} offset {offset} count {count}", fid.id());
        let reply = self.rpc(&Fcall::Treaddir(Treaddir {
            fid: fid.id(),
            offset,
            count,
        }))?;
        let decoded = reply.decode()?;
        let data = match decoded.fcall {
            Fcall::Rreaddir(r) => r.data,
            _ => return Err(Error::Protocol),
        };
        let mut n = data.len();
        if n > count as usize {
            log::warn!("bogus Rreaddir count ({n} > {count})");
            n = count as usize;
        }
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Read a whole directory (9P2000.L), re-issuing `Treaddir` until the
    /// server runs dry.
    pub fn readdir_all(&self, fid: &Fid) -> Result<Vec<DirEntry<'static>>, Error> {
        self.require_dotl()?;
        let mut entries = Vec::new();
        let mut buf = vec![0u8; self.msize() as usize];
        let mut offset = 0u64;
        loop {
            let n = self.readdir(fid, offset, &mut buf)?;
            if n == 0 {
                break;
            }
            let mut rest = &buf[..n];
            while !rest.is_empty() {
                let (entry, used) = parse_dirent(rest)?;
                offset = entry.offset;
                entries.push(entry.clone_static());
                rest = &rest[used..];
            }
        }
        Ok(entries)
    }

    /// The target of the symbolic link `fid` names.
    pub fn readlink(&self, fid: &Fid) -> Result<String, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Treadlink(Treadlink { fid: fid.id() }))?;
        match reply.decode()?.fcall {
            Fcall::Rreadlink(r) => Ok(String::from_utf8_lossy(r.target.as_bytes()).into_owned()),
            _ => Err(Error::Protocol),
        }
    }

    /// Create a device node `name` under the directory `dfid`.
    pub fn mknod(
        &self,
        dfid: &Fid,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> Result<Qid, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tmknod(Tmknod {
            dfid: dfid.id(),
            name: name.into(),
            mode,
            major,
            minor,
            gid,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rmknod(r) => Ok(r.qid),
            _ => Err(Error::Protocol),
        }
    }

    /// Hard-link the file `fid` as `name` under the directory `dfid`.
    pub fn link(&self, dfid: &Fid, fid: &Fid, name: &str) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tlink(Tlink {
            dfid: dfid.id(),
            fid: fid.id(),
            name: name.into(),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rlink(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// Create a symlink `name` pointing at `symtgt` under the directory
    /// `dfid`.
    pub fn symlink(&self, dfid: &Fid, name: &str, symtgt: &str, gid: u32) -> Result<Qid, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tsymlink(Tsymlink {
            fid: dfid.id(),
            name: name.into(),
            symtgt: symtgt.into(),
            gid,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rsymlink(r) => Ok(r.qid),
            _ => Err(Error::Protocol),
        }
    }

    /// Create the directory `name` under `dfid`.
    pub fn mkdir(&self, dfid: &Fid, name: &str, mode: u32, gid: u32) -> Result<Qid, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tmkdir(Tmkdir {
            dfid: dfid.id(),
            name: name.into(),
            mode,
            gid,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rmkdir(r) => Ok(r.qid),
            _ => Err(Error::Protocol),
        }
    }

    /// Unlink `name` under the directory `dfid`; pass [`AT_REMOVEDIR`] in
    /// `flags` for directories.
    pub fn unlinkat(&self, dfid: &Fid, name: &str, flags: u32) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tunlinkat(Tunlinkat {
            dfid: dfid.id(),
            name: name.into(),
            flags,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Runlinkat(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// Move the file `fid` names to `name` under the directory `dfid`.
    pub fn rename(&self, fid: &Fid, dfid: &Fid, name: &str) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Trename(Trename {
            fid: fid.id(),
            dfid: dfid.id(),
            name: name.into(),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rrename(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// Rename by directory-and-name pairs.
    pub fn renameat(
        &self,
        olddfid: &Fid,
        oldname: &str,
        newdfid: &Fid,
        newname: &str,
    ) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Trenameat(Trenameat {
            olddfid: olddfid.id(),
            oldname: oldname.into(),
            newdfid: newdfid.id(),
            newname: newname.into(),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rrenameat(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// File attributes, legacy form.
    pub fn getattr(&self, fid: &Fid) -> Result<WStat<'static>, Error> {
        self.require_legacy()?;
        let reply = self.rpc(&Fcall::Tstat(Tstat { fid: fid.id() }))?;
        match reply.decode()?.fcall {
            Fcall::Rstat(r) => Ok(r.stat.clone_static()),
            _ => Err(Error::Protocol),
        }
    }

    /// File attributes, 9P2000.L form.
    pub fn getattr_dotl(&self, fid: &Fid, req_mask: GetattrMask) -> Result<Rgetattr, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tgetattr(Tgetattr {
            fid: fid.id(),
            req_mask,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rgetattr(r) => Ok(r),
            _ => Err(Error::Protocol),
        }
    }

    /// Update file attributes, legacy form.
    pub fn setattr(&self, fid: &Fid, stat: &WStat<'_>) -> Result<(), Error> {
        self.require_legacy()?;
        let reply = self.rpc(&Fcall::Twstat(Twstat {
            fid: fid.id(),
            stat: stat.clone(),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rwstat(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// Update file attributes, 9P2000.L form.
    pub fn setattr_dotl(
        &self,
        fid: &Fid,
        valid: SetattrMask,
        stat: SetAttr,
    ) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tsetattr(Tsetattr {
            fid: fid.id(),
            valid,
            stat,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rsetattr(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }

    /// Acquire or release a POSIX byte-range lock.
    pub fn lock(&self, fid: &Fid, flock: &Flock<'_>) -> Result<LockStatus, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tlock(Tlock {
            fid: fid.id(),
            flock: flock.clone(),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rlock(r) => Ok(r.status),
            _ => Err(Error::Protocol),
        }
    }

    /// Test for a conflicting byte-range lock.
    pub fn getlock(&self, fid: &Fid, glock: &Getlock<'_>) -> Result<Getlock<'static>, Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Tgetlock(Tgetlock {
            fid: fid.id(),
            flock: glock.clone(),
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rgetlock(r) => Ok(r.flock.clone_static()),
            _ => Err(Error::Protocol),
        }
    }

    /// Walk to the extended attribute `name` of the file `fid` names.
    ///
    /// Returns a fresh fid positioned at the attribute plus the attribute
    /// size; read it with [`Session::read`] and release it with
    /// [`Session::clunk`].
    pub fn xattrwalk(&self, fid: &Fid, name: &str) -> Result<(Arc<Fid>, u64), Error> {
        self.require_dotl()?;
        let attr_fid = self.fid_create()?;
        let size = (|| {
            let reply = self.rpc(&Fcall::Txattrwalk(Txattrwalk {
                fid: fid.id(),
                new_fid: attr_fid.id(),
                name: name.into(),
            }))?;
            match reply.decode()?.fcall {
                Fcall::Rxattrwalk(r) => Ok(r.size),
                _ => Err(Error::Protocol),
            }
        })();
        match size {
            Ok(size) => Ok((attr_fid, size)),
            Err(err) => {
                self.fid_destroy(&attr_fid);
                Err(err)
            }
        }
    }

    /// Prepare `fid` for writing the extended attribute `name`.
    pub fn xattrcreate(
        &self,
        fid: &Fid,
        name: &str,
        attr_size: u64,
        flags: u32,
    ) -> Result<(), Error> {
        self.require_dotl()?;
        let reply = self.rpc(&Fcall::Txattrcreate(Txattrcreate {
            fid: fid.id(),
            name: name.into(),
            attr_size,
            flags,
        }))?;
        match reply.decode()?.fcall {
            Fcall::Rxattrcreate(_) => Ok(()),
            _ => Err(Error::Protocol),
        }
    }
}
