//! FUSE filesystem over a remote file service.
//!
//! [`RemoteFs`] implements the fuser `Filesystem` trait. Callbacks run on the
//! session thread; each one clones the [`RemoteOps`] orchestrator into a
//! future and blocks on it through the [`Bridge`].
//!
//! | Operation | Notes |
//! |-----------|-------|
//! | lookup/forget | nlookup tracked in the node tree |
//! | getattr/setattr | always fetched from the backend, TTLs only bound the kernel cache |
//! | mknod/mkdir/symlink/create | compensated on partial failure |
//! | open/read/write/flush/fsync/release | keyed by the path and descriptor held in the handle |
//! | opendir/readdir/readdirplus | lazy stream, one entry per remote page |
//! | xattrs | UTF-8 values only |
//! | copy_file_range | only between handles opened here |
//! | rename | flags rejected with EINVAL |

use crate::attr::{SetAttrRequest, apply_page_estimate, entry_attr, kind_from_mode};
use crate::bridge::{Bridge, BridgeStats};
use crate::config::MountConfig;
use crate::dirstream::DirEntry;
use crate::error::{Errno, FsError, FsResult};
use crate::handles::OpenHandle;
use crate::inode::StableAttr;
use crate::ops::{Caller, NodeInfo, RemoteOps};
use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use remfs_client::RemoteClient;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, trace};

/// Offset of the `.` entry in a directory listing.
const DOT_OFFSET: i64 = 1;

/// Offset of the `..` entry. Stream entries follow from here.
const DOTDOT_OFFSET: i64 = 2;

/// What a readdir slot refers to.
#[derive(Debug, Clone, Copy)]
enum DirSlot<'a> {
    Dot,
    DotDot,
    Entry(&'a DirEntry),
}

fn utf8(name: &OsStr) -> FsResult<String> {
    name.to_str().map(str::to_owned).ok_or(Errno::EINVAL)
}

fn caller(req: &Request<'_>) -> Option<Caller> {
    Some(Caller {
        uid: req.uid(),
        gid: req.gid(),
    })
}

/// Answer to an xattr read: the value's length for a size probe, else the value.
#[derive(Debug, PartialEq, Eq)]
enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

fn size_xattr(data: Vec<u8>, size: u32) -> FsResult<XattrReply> {
    if size == 0 {
        return Ok(XattrReply::Size(
            u32::try_from(data.len()).map_err(|_| Errno::ERANGE)?,
        ));
    }
    if data.len() > size as usize {
        return Err(Errno::ERANGE);
    }
    Ok(XattrReply::Data(data))
}

fn reply_xattr(result: FsResult<Vec<u8>>, size: u32, reply: ReplyXattr) {
    match result.and_then(|data| size_xattr(data, size)) {
        Ok(XattrReply::Size(len)) => reply.size(len),
        Ok(XattrReply::Data(data)) => reply.data(&data),
        Err(e) => reply.error(e.code()),
    }
}

/// A mounted view of one remote directory tree.
pub struct RemoteFs {
    ops: RemoteOps,
    bridge: Bridge,
    config: MountConfig,
    /// Dropped last so no bridged call outlives its runtime.
    _owned_runtime: Option<Runtime>,
}

impl std::fmt::Debug for RemoteFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs")
            .field("ops", &self.ops)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteFs {
    /// Creates the filesystem on a runtime of its own.
    ///
    /// # Errors
    ///
    /// Fails if the runtime cannot start, volume info cannot be fetched, or
    /// the configured remote root is not a directory.
    pub fn new(client: Arc<dyn RemoteClient>, config: MountConfig) -> Result<Self, FsError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("remfs-io")
            .build()
            .map_err(FsError::Runtime)?;
        let handle = runtime.handle().clone();
        Self::build(client, config, Some(runtime), handle)
    }

    /// Creates the filesystem on an existing runtime.
    ///
    /// The runtime must stay alive for as long as the filesystem is mounted.
    /// Must not be called from one of that runtime's worker threads.
    pub fn with_runtime(
        client: Arc<dyn RemoteClient>,
        config: MountConfig,
        handle: Handle,
    ) -> Result<Self, FsError> {
        Self::build(client, config, None, handle)
    }

    fn build(
        client: Arc<dyn RemoteClient>,
        config: MountConfig,
        owned_runtime: Option<Runtime>,
        handle: Handle,
    ) -> Result<Self, FsError> {
        let bridge = Bridge::new(handle, config.io_timeout);
        let setup = config.clone();
        let ops = bridge.run(async move { RemoteOps::connect(client, &setup).await })??;

        info!(
            root = %config.remote_root,
            privileged = config.privileged,
            entry_ttl_ms = config.entry_ttl.as_millis(),
            attr_ttl_ms = config.attr_ttl.as_millis(),
            io_timeout_secs = config.io_timeout.as_secs(),
            "RemoteFs initialized"
        );

        Ok(Self {
            ops,
            bridge,
            config,
            _owned_runtime: owned_runtime,
        })
    }

    pub fn ops(&self) -> &RemoteOps {
        &self.ops
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn bridge_stats(&self) -> &BridgeStats {
        self.bridge.stats()
    }

    fn reply_entry(&self, result: FsResult<NodeInfo>, reply: ReplyEntry) {
        match result {
            Ok(node) => reply.entry(&self.config.entry_ttl, &node.attr, node.stable.generation),
            Err(e) => reply.error(e.code()),
        }
    }

    /// Restarts the directory stream and skips to `offset`.
    fn reposition(&self, fh: u64, offset: i64) -> FsResult<()> {
        let dir = self.ops.dir(fh)?;
        let ops = self.ops.clone();
        let path = dir.path.clone();
        let stream = Arc::new(self.bridge.call(async move { ops.open_stream(path).await })?);
        debug!(fh, offset, path = %dir.path, "Repositioning directory stream");

        let mut state = dir.state.lock();
        state.stream = Arc::clone(&stream);
        state.parked = None;
        state.delivered = offset.clamp(0, DOTDOT_OFFSET);
        while state.delivered < offset {
            let stream = Arc::clone(&stream);
            match self.bridge.call(async move { stream.next().await })? {
                Some(_) => state.delivered += 1,
                None => break,
            }
        }
        Ok(())
    }

    /// Feeds directory slots after `offset` to `push` until it reports a
    /// full buffer or the stream is exhausted.
    ///
    /// `push` receives the offset of the slot, its name and what it refers
    /// to, and returns true when the slot did not fit. A rejected stream
    /// entry is parked and offered again on the next call.
    fn fill_dir<F>(&self, fh: u64, offset: i64, mut push: F) -> FsResult<()>
    where
        F: FnMut(i64, &str, DirSlot<'_>) -> bool,
    {
        let dir = self.ops.dir(fh)?;
        if offset != dir.state.lock().delivered {
            self.reposition(fh, offset)?;
        }

        let mut state = dir.state.lock();
        if state.delivered < DOT_OFFSET {
            if push(DOT_OFFSET, ".", DirSlot::Dot) {
                return Ok(());
            }
            state.delivered = DOT_OFFSET;
        }
        if state.delivered < DOTDOT_OFFSET {
            if push(DOTDOT_OFFSET, "..", DirSlot::DotDot) {
                return Ok(());
            }
            state.delivered = DOTDOT_OFFSET;
        }

        loop {
            let entry = match state.parked.take() {
                Some(entry) => entry,
                None => {
                    let stream = Arc::clone(&state.stream);
                    match self.bridge.call(async move { stream.next().await })? {
                        Some((entry, _last)) => entry,
                        None => break,
                    }
                }
            };
            let next = state.delivered + 1;
            if push(next, &entry.name, DirSlot::Entry(&entry)) {
                state.parked = Some(entry);
                break;
            }
            state.delivered = next;
        }
        Ok(())
    }
}

impl Filesystem for RemoteFs {
    /// Initialize the filesystem.
    ///
    /// # FUSE Spec
    /// Called once when the filesystem is mounted, before any other request.
    ///
    /// # Implementation
    /// Enables `FUSE_ASYNC_READ`; the remote connection is already up.
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!(root = %self.ops.tree().remote_root(), "FUSE filesystem initialized");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        let stats = self.bridge.stats();
        info!(
            operations = stats.operations_started.load(Ordering::Relaxed),
            timeouts = stats.operations_timed_out.load(Ordering::Relaxed),
            open_handles = self.ops.handles().len(),
            "FUSE filesystem destroyed"
        );
    }

    /// Look up a directory entry by name and get its attributes.
    ///
    /// # FUSE Spec (libfuse `fuse_lowlevel_ops.lookup`)
    ///
    /// The lookup count of the found inode is incremented by one for each
    /// successful `fuse_reply_entry`.
    ///
    /// # Implementation Notes
    ///
    /// - Attributes always come from the backend
    /// - The node keeps the remote device id as its inode number
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, "lookup");
        let ops = self.ops.clone();
        let result = self
            .bridge
            .call(async move { ops.lookup(parent, &name).await });
        self.reply_entry(result, reply);
    }

    /// # FUSE Spec
    /// Decrements the lookup count by `nlookup`. The inode may be evicted at zero.
    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup = nlookup, "forget");
        self.ops.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.ops.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, fh = ?fh, "getattr");
        let ops = self.ops.clone();
        let by_handle =
            fh.filter(|fh| matches!(self.ops.handles().get(*fh), Some(OpenHandle::File(_))));
        let result = self.bridge.call(async move {
            match by_handle {
                Some(fh) => ops.getattr_handle(ino, fh).await,
                None => ops.getattr(ino).await,
            }
        });
        match result {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(e.code()),
        }
    }

    /// Set file attributes.
    ///
    /// # FUSE Spec
    /// Each `Some` field is a requested change. The reply carries the
    /// resulting attributes.
    ///
    /// # Implementation
    /// Changes are applied in order: mode, owner, times, size. The first
    /// failure is returned and later changes are skipped. ctime, crtime,
    /// chgtime, bkuptime and flags are ignored.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(
            inode = ino,
            mode = ?mode,
            uid = ?uid,
            gid = ?gid,
            size = ?size,
            fh = ?fh,
            "setattr"
        );
        let req = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        let ops = self.ops.clone();
        match self
            .bridge
            .call(async move { ops.setattr(ino, fh, req).await })
        {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(e.code()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.readlink(ino).await }) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.code()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, mode = mode, "mknod");
        let ops = self.ops.clone();
        let caller = caller(req);
        let result = self.bridge.call(async move {
            ops.mknod(parent, &name, mode & !umask, rdev, caller).await
        });
        self.reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, mode = mode, "mkdir");
        let ops = self.ops.clone();
        let caller = caller(req);
        let result = self
            .bridge
            .call(async move { ops.mkdir(parent, &name, mode & !umask, caller).await });
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, "unlink");
        let ops = self.ops.clone();
        match self
            .bridge
            .call(async move { ops.unlink(parent, &name).await })
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, "rmdir");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.rmdir(parent, &name).await }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (name, target) = match (utf8(link_name), utf8(target.as_os_str())) {
            (Ok(name), Ok(target)) => (name, target),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, target = %target, "symlink");
        let ops = self.ops.clone();
        let caller = caller(req);
        let result = self
            .bridge
            .call(async move { ops.symlink(parent, &name, &target, caller).await });
        self.reply_entry(result, reply);
    }

    /// # FUSE Spec
    /// Renames `parent/name` to `newparent/newname`, replacing any existing
    /// target. `RENAME_NOREPLACE` and `RENAME_EXCHANGE` arrive in `flags`.
    ///
    /// # Implementation
    /// Any flag is rejected with `EINVAL`.
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (utf8(name), utf8(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.code()),
        };
        trace!(
            parent = parent,
            name = %name,
            newparent = newparent,
            newname = %newname,
            flags = flags,
            "rename"
        );
        let ops = self.ops.clone();
        match self.bridge.call(async move {
            ops.rename(parent, &name, newparent, &newname, flags).await
        }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags = flags, "open");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.open(ino, flags).await }) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.code()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, size = size, "read");
        let ops = self.ops.clone();
        match self
            .bridge
            .call(async move { ops.read(fh, offset, size).await })
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.code()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(
            inode = ino,
            fh = fh,
            offset = offset,
            len = data.len(),
            "write"
        );
        let ops = self.ops.clone();
        let data = data.to_vec();
        match self
            .bridge
            .call(async move { ops.write(fh, offset, &data).await })
        {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.code()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, "flush");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.flush(fh).await }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, datasync = datasync, "fsync");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.fsync(fh).await }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    /// # FUSE Spec
    /// Called exactly once per open file handle.
    ///
    /// # Implementation
    /// The handle is dropped even when the remote release fails; the error
    /// is still reported.
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh = fh, "release");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.release(fh).await }) {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!(fh = fh, errno = e.code(), "release failed");
                reply.error(e.code());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.opendir(ino).await }) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.code()),
        }
    }

    /// Read directory entries.
    ///
    /// # FUSE Spec (libfuse `fuse_lowlevel_ops.readdir`)
    ///
    /// `offset` is 0 on the first call and otherwise the offset of the last
    /// entry the kernel accepted. Entries are added until the buffer is full.
    /// readdir does not affect lookup counts.
    ///
    /// # Implementation Notes
    ///
    /// - `.` and `..` take offsets 1 and 2, stream entries follow
    /// - A seek to any other offset restarts the stream and skips forward
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, "readdir");
        let parent = self.ops.parent_of(ino);
        let tree = self.ops.tree();
        let result = self.fill_dir(fh, offset, |next, name, slot| match slot {
            DirSlot::Dot => reply.add(ino, next, FileType::Directory, name),
            DirSlot::DotDot => reply.add(parent, next, FileType::Directory, name),
            DirSlot::Entry(entry) => reply.add(
                tree.kernel_ino(entry.id),
                next,
                kind_from_mode(entry.mode),
                name,
            ),
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    /// Read directory entries with attributes.
    ///
    /// # FUSE Spec
    /// Like readdir, but every entry other than `.` and `..` counts as a
    /// lookup once it has been added to the reply.
    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, "readdirplus");
        let parent = self.ops.parent_of(ino);
        let ops = self.ops.clone();
        let dots = if offset < DOTDOT_OFFSET {
            self.bridge.call(async move {
                let mut dot = ops.getattr(ino).await?;
                let mut dotdot = ops.getattr(parent).await?;
                apply_page_estimate(&mut dot);
                apply_page_estimate(&mut dotdot);
                Ok(Some((dot, dotdot)))
            })
        } else {
            Ok(None)
        };
        let dots = match dots {
            Ok(dots) => dots,
            Err(e) => return reply.error(e.code()),
        };

        let ttl = self.config.entry_ttl;
        let tree = self.ops.tree();
        let result = self.fill_dir(fh, offset, |next, name, slot| match (slot, &dots) {
            (DirSlot::Dot, Some((dot, _))) => reply.add(ino, next, name, &ttl, dot, 0),
            (DirSlot::DotDot, Some((_, dotdot))) => reply.add(parent, next, name, &ttl, dotdot, 0),
            // The stream only replays dots after an offset below 2.
            (DirSlot::Dot | DirSlot::DotDot, None) => false,
            (DirSlot::Entry(entry), _) => {
                let child = tree.kernel_ino(entry.id);
                let attr = entry_attr(&entry.stat, child);
                let generation = StableAttr::from_stat(&entry.stat).generation;
                let full = reply.add(child, next, name, &ttl, &attr, generation);
                if !full {
                    tree.insert(ino, name, &entry.stat);
                }
                full
            }
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, "releasedir");
        match self.ops.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    /// Get filesystem statistics.
    ///
    /// # Implementation
    /// Available blocks are reported equal to free blocks. The backend has
    /// no inode accounting, so file counts are zero.
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        trace!("statfs");
        let ops = self.ops.clone();
        match self.bridge.call(async move { ops.statfs().await }) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bfree,
                0,
                0,
                st.bsize,
                st.namelen,
                st.bsize,
            ),
            Err(e) => reply.error(e.code()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(inode = ino, name = %name, size = size, "getxattr");
        let ops = self.ops.clone();
        let result = self
            .bridge
            .call(async move { ops.getxattr(ino, &name).await });
        reply_xattr(result, size, reply);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(inode = ino, name = %name, len = value.len(), "setxattr");
        let ops = self.ops.clone();
        let value = value.to_vec();
        match self
            .bridge
            .call(async move { ops.setxattr(ino, &name, &value).await })
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, size = size, "listxattr");
        let ops = self.ops.clone();
        let result = self.bridge.call(async move { ops.listxattr(ino).await });
        reply_xattr(result, size, reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(inode = ino, name = %name, "removexattr");
        let ops = self.ops.clone();
        match self
            .bridge
            .call(async move { ops.removexattr(ino, &name).await })
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    /// Create and open a file.
    ///
    /// # FUSE Spec
    /// Replies with the new entry and an open handle. The entry counts as a
    /// lookup.
    ///
    /// # Implementation
    /// `mknod` then `open`; the node is removed again if either the
    /// attribute re-read or the open fails.
    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match utf8(name) {
            Ok(name) => name,
            Err(e) => return reply.error(e.code()),
        };
        trace!(parent = parent, name = %name, mode = mode, flags = flags, "create");
        let ops = self.ops.clone();
        let caller = caller(req);
        match self.bridge.call(async move {
            ops.create(parent, &name, mode & !umask, flags, caller).await
        }) {
            Ok((node, fh)) => reply.created(
                &self.config.entry_ttl,
                &node.attr,
                node.stable.generation,
                fh,
                0,
            ),
            Err(e) => reply.error(e.code()),
        }
    }

    /// # FUSE Spec
    /// Copies `len` bytes between two open files without passing the data
    /// through userspace. Replies with the number of bytes copied.
    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        trace!(
            ino_in = ino_in,
            ino_out = ino_out,
            offset_in = offset_in,
            offset_out = offset_out,
            len = len,
            "copy_file_range"
        );
        let ops = self.ops.clone();
        match self.bridge.call(async move {
            ops.copy_file_range(fh_in, offset_in, fh_out, offset_out, len)
                .await
        }) {
            Ok(copied) => reply.written(u32::try_from(copied).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::ROOT_INODE;
    use remfs_client::MemoryRemote;

    fn fixture(names: &[&str]) -> (Runtime, Arc<MemoryRemote>, RemoteFs) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let remote = Arc::new(MemoryRemote::new());
        rt.block_on(async {
            for name in names {
                remote.mknod(&format!("/{name}"), 0o644, 0).await.unwrap();
            }
        });
        let fs = RemoteFs::with_runtime(
            remote.clone(),
            MountConfig::default().privileged(false),
            rt.handle().clone(),
        )
        .unwrap();
        (rt, remote, fs)
    }

    fn opendir(fs: &RemoteFs) -> u64 {
        let ops = fs.ops.clone();
        fs.bridge
            .call(async move { ops.opendir(ROOT_INODE).await })
            .unwrap()
    }

    /// Collects up to `room` slots, like a reply buffer of that capacity.
    fn list(fs: &RemoteFs, fh: u64, offset: i64, room: usize) -> Vec<(i64, String)> {
        let mut out = Vec::new();
        fs.fill_dir(fh, offset, |next, name, _| {
            if out.len() == room {
                return true;
            }
            out.push((next, name.to_string()));
            false
        })
        .unwrap();
        out
    }

    fn names(slots: &[(i64, String)]) -> Vec<&str> {
        slots.iter().map(|(_, n)| n.as_str()).collect()
    }

    #[test]
    fn empty_directory_lists_dots_only() {
        let (_rt, _remote, fs) = fixture(&[]);
        let fh = opendir(&fs);
        let slots = list(&fs, fh, 0, 100);
        assert_eq!(slots, [(1, ".".to_string()), (2, "..".to_string())]);
        assert!(list(&fs, fh, 2, 100).is_empty());
    }

    #[test]
    fn entries_follow_dots_in_order() {
        let (_rt, _remote, fs) = fixture(&["a", "b", "c"]);
        let fh = opendir(&fs);
        let slots = list(&fs, fh, 0, 100);
        assert_eq!(names(&slots), [".", "..", "a", "b", "c"]);
        assert_eq!(slots.last().map(|(o, _)| *o), Some(5));
    }

    #[test]
    fn full_buffer_parks_entry_for_next_call() {
        let (_rt, _remote, fs) = fixture(&["a", "b", "c"]);
        let fh = opendir(&fs);
        assert_eq!(names(&list(&fs, fh, 0, 3)), [".", "..", "a"]);
        let rest = list(&fs, fh, 3, 100);
        assert_eq!(rest, [(4, "b".to_string()), (5, "c".to_string())]);
        assert!(list(&fs, fh, 5, 100).is_empty());
    }

    #[test]
    fn offset_zero_restarts_listing() {
        let (_rt, _remote, fs) = fixture(&["a", "b"]);
        let fh = opendir(&fs);
        list(&fs, fh, 0, 100);
        assert_eq!(names(&list(&fs, fh, 0, 100)), [".", "..", "a", "b"]);
    }

    #[test]
    fn seek_skips_to_offset() {
        let (_rt, _remote, fs) = fixture(&["a", "b", "c"]);
        let fh = opendir(&fs);
        list(&fs, fh, 0, 100);
        assert_eq!(list(&fs, fh, 4, 100), [(5, "c".to_string())]);
    }

    #[test]
    fn readdir_on_file_handle_is_rejected() {
        let (_rt, _remote, fs) = fixture(&["f"]);
        let ops = fs.ops.clone();
        let fh = fs
            .bridge
            .call(async move {
                let node = ops.lookup(ROOT_INODE, "f").await?;
                ops.open(node.ino, libc::O_RDONLY).await
            })
            .unwrap();
        let err = fs.fill_dir(fh, 0, |_, _, _| false).unwrap_err();
        assert_eq!(err, Errno::ENOTDIR);
        assert_eq!(fs.fill_dir(999, 0, |_, _, _| false).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn missing_root_fails_construction() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let err = RemoteFs::with_runtime(
            Arc::new(MemoryRemote::new()),
            MountConfig::default().remote_root("/nope"),
            rt.handle().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, FsError::RemoteRoot(_)));
    }

    #[test]
    fn xattr_size_probe_and_range() {
        let data = b"user.a\0user.bb\0".to_vec();
        assert_eq!(size_xattr(data.clone(), 0), Ok(XattrReply::Size(15)));
        assert_eq!(size_xattr(data.clone(), 4), Err(Errno::ERANGE));
        assert_eq!(size_xattr(data.clone(), 15), Ok(XattrReply::Data(data)));
        assert_eq!(size_xattr(Vec::new(), 0), Ok(XattrReply::Size(0)));
    }
}
