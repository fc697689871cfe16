//! Filesystem operations as sequences of remote calls.
//!
//! [`RemoteOps`] is what the FUSE callbacks drive. Each method resolves paths
//! through the [`NodeTree`], calls the remote service, and translates the
//! result. Nothing about remote state is cached between calls.
//!
//! Creating operations (`mkdir`, `mknod`, `symlink`, `create`) run as a small
//! saga:
//!
//! 1. issue the remote creation call, failing immediately on error;
//! 2. hand the object to the caller when running privileged (best effort);
//! 3. re-read its attributes, deleting the object again if that fails;
//! 4. for `create`, open it, deleting it again if that fails;
//! 5. link the new node into the tree.
//!
//! Steps 1-4 run on a task of their own. A caller that stops waiting (the
//! bridge timed out, say) cannot cut the saga short between the create and
//! its compensation, and a saga that succeeds after its caller left deletes
//! what it made.

use crate::attr::{SetAttrRequest, stat_to_attr};
use crate::config::MountConfig;
use crate::dirstream::DirStream;
use crate::error::{Errno, FsError, FsResult};
use crate::handles::{DirHandle, OpenHandle, OpenHandleTable, RemoteFile};
use crate::inode::{NodeTree, ROOT_INODE, StableAttr, normalize_root};
use fuser::FileAttr;
use remfs_client::{FsStats, RemoteClient, S_IFMT, S_IFREG, Stat};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Largest byte count a single copy_file_range reply can carry.
pub const MAX_COPY_LEN: u64 = u32::MAX as u64;

/// Identity of the process that issued a kernel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

/// A node handed back to the kernel after lookup or creation.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Kernel inode number.
    pub ino: u64,
    pub stable: StableAttr,
    pub attr: FileAttr,
}

/// Which compensating call undoes a half-finished creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Undo {
    RmDir,
    Unlink,
}

/// A verified object that is not linked into the tree yet.
#[derive(Debug)]
struct Created {
    stat: Stat,
    /// Descriptor opened by `create`.
    fd: Option<i64>,
}

/// Receiving end of a running create saga.
///
/// Dropping it before the saga reported back closes the channel. A result
/// that was already sent but never read is compensated here.
struct PendingCreate {
    rx: oneshot::Receiver<FsResult<Created>>,
    ops: RemoteOps,
    path: String,
    undo: Undo,
}

impl Drop for PendingCreate {
    fn drop(&mut self) {
        self.rx.close();
        let Ok(Ok(created)) = self.rx.try_recv() else {
            return;
        };
        let ops = self.ops.clone();
        let path = std::mem::take(&mut self.path);
        let undo = self.undo;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { ops.abandon(&path, undo, created).await });
            }
            Err(_) => warn!(path = %path, "No runtime to roll back abandoned create"),
        }
    }
}

/// The operation orchestrator.
///
/// Cheap to clone; clones share the connection, tree and handle table.
#[derive(Clone)]
pub struct RemoteOps {
    client: Arc<dyn RemoteClient>,
    tree: Arc<NodeTree>,
    handles: Arc<OpenHandleTable>,
    privileged: bool,
}

impl std::fmt::Debug for RemoteOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOps")
            .field("tree", &self.tree)
            .field("privileged", &self.privileged)
            .finish_non_exhaustive()
    }
}

impl RemoteOps {
    /// Builds the orchestrator for an established connection.
    ///
    /// Fetches volume metadata and checks the mount root once. Either
    /// failure is fatal.
    pub async fn connect(
        client: Arc<dyn RemoteClient>,
        config: &MountConfig,
    ) -> Result<Self, FsError> {
        let volume = client.volume_info().await.map_err(FsError::VolumeInfo)?;
        let remote_root = normalize_root(&config.remote_root);
        let root = client
            .stat(&remote_root)
            .await
            .map_err(|e| FsError::RemoteRoot(format!("{remote_root}: {e}")))?;
        if !root.is_dir() {
            return Err(FsError::RemoteRoot(remote_root));
        }
        let root_dev = if remote_root == "/" {
            volume.serial_number
        } else {
            root.dev
        };
        info!(
            volume = %volume.name,
            serial = volume.serial_number,
            root = %remote_root,
            root_dev,
            "Remote volume ready"
        );
        Ok(Self::new(
            client,
            NodeTree::new(&remote_root, root_dev),
            config.privileged,
        ))
    }

    pub fn new(client: Arc<dyn RemoteClient>, tree: NodeTree, privileged: bool) -> Self {
        Self {
            client,
            tree: Arc::new(tree),
            handles: Arc::new(OpenHandleTable::new()),
            privileged,
        }
    }

    pub fn client(&self) -> &Arc<dyn RemoteClient> {
        &self.client
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn handles(&self) -> &OpenHandleTable {
        &self.handles
    }

    fn path_of(&self, ino: u64) -> FsResult<String> {
        self.tree.path(ino).ok_or(Errno::ENOENT)
    }

    fn child_path_of(&self, parent: u64, name: &str) -> FsResult<String> {
        self.tree.child_path(parent, name).ok_or(Errno::ENOENT)
    }

    fn file(&self, fh: u64) -> FsResult<Arc<RemoteFile>> {
        match self.handles.get(fh) {
            Some(OpenHandle::File(file)) => Ok(file),
            Some(OpenHandle::Dir(_)) => Err(Errno::EISDIR),
            None => Err(Errno::EBADF),
        }
    }

    pub fn dir(&self, fh: u64) -> FsResult<Arc<DirHandle>> {
        match self.handles.get(fh) {
            Some(OpenHandle::Dir(dir)) => Ok(dir),
            Some(OpenHandle::File(_)) => Err(Errno::ENOTDIR),
            None => Err(Errno::EBADF),
        }
    }

    /// Links a verified object into the tree and builds its kernel record.
    pub fn link(&self, parent: u64, name: &str, stat: &Stat) -> NodeInfo {
        let ino = self.tree.insert(parent, name, stat);
        NodeInfo {
            ino,
            stable: StableAttr::from_stat(stat),
            attr: stat_to_attr(stat, ino),
        }
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> FsResult<NodeInfo> {
        let path = self.child_path_of(parent, name)?;
        let stat = self.client.get_attr(&path).await.inspect_err(|e| {
            trace!(path = %path, error = %e, "lookup failed");
        })?;
        Ok(self.link(parent, name, &stat))
    }

    pub async fn getattr(&self, ino: u64) -> FsResult<FileAttr> {
        let path = self.path_of(ino)?;
        let stat = self.client.get_attr(&path).await?;
        Ok(stat_to_attr(&stat, ino))
    }

    /// Attributes through an open file handle, keyed by the handle's path.
    pub async fn getattr_handle(&self, ino: u64, fh: u64) -> FsResult<FileAttr> {
        let file = self.file(fh)?;
        let stat = self.client.get_attr(file.path()).await?;
        Ok(stat_to_attr(&stat, ino))
    }

    /// Applies `req` and returns the backend's resulting attributes.
    pub async fn setattr(
        &self,
        ino: u64,
        fh: Option<u64>,
        req: SetAttrRequest,
    ) -> FsResult<FileAttr> {
        let path = match fh.map(|fh| self.handles.get(fh)) {
            Some(Some(OpenHandle::File(file))) => file.path().to_string(),
            _ => self.path_of(ino)?,
        };
        let stat = req.apply(self.client.as_ref(), &path).await?;
        Ok(stat_to_attr(&stat, ino))
    }

    pub async fn readlink(&self, ino: u64) -> FsResult<String> {
        let path = self.path_of(ino)?;
        Ok(self.client.read_link(&path).await?)
    }

    /// Hands `path` to the caller. Failures are logged and ignored.
    async fn preserve_owner(&self, path: &str, caller: Option<Caller>) {
        if !self.privileged {
            return;
        }
        let Some(caller) = caller else {
            return;
        };
        if let Err(e) = self
            .client
            .chown(path, i64::from(caller.uid), i64::from(caller.gid))
            .await
        {
            debug!(path, uid = caller.uid, gid = caller.gid, error = %e, "Could not preserve owner");
        }
    }

    /// Deletes a half-created object. Failures are logged and ignored.
    async fn undo(&self, path: &str, undo: Undo) {
        let result = match undo {
            Undo::RmDir => self.client.rmdir(path).await,
            Undo::Unlink => self.client.unlink(path).await,
        };
        match result {
            Ok(()) => debug!(path, ?undo, "Rolled back partial create"),
            Err(e) => debug!(path, ?undo, error = %e, "Rollback failed"),
        }
    }

    /// Ownership and verification steps shared by every creating operation.
    async fn verify_created(
        &self,
        path: &str,
        undo: Undo,
        caller: Option<Caller>,
    ) -> FsResult<Stat> {
        self.preserve_owner(path, caller).await;
        match self.client.get_attr(path).await {
            Ok(stat) => Ok(stat),
            Err(e) => {
                debug!(path, error = %e, "Verification after create failed");
                self.undo(path, undo).await;
                Err(e.into())
            }
        }
    }

    /// Runs the remote part of a creating operation on its own task.
    fn spawn_create<F>(&self, path: &str, undo: Undo, saga: F) -> PendingCreate
    where
        F: Future<Output = FsResult<Created>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let ops = self.clone();
        let owned = path.to_string();
        tokio::spawn(async move {
            let result = saga.await;
            if let Err(Ok(created)) = tx.send(result) {
                ops.abandon(&owned, undo, created).await;
            }
        });
        PendingCreate {
            rx,
            ops: self.clone(),
            path: path.to_string(),
            undo,
        }
    }

    /// Waits for a saga started by [`spawn_create`](Self::spawn_create).
    async fn finish_create(mut pending: PendingCreate) -> FsResult<Created> {
        match (&mut pending.rx).await {
            Ok(result) => result,
            Err(_) => Err(Errno::EIO),
        }
    }

    /// Removes an object whose create finished after the caller gave up.
    async fn abandon(&self, path: &str, undo: Undo, created: Created) {
        warn!(path, ?undo, "Create completed after its caller gave up, rolling back");
        if let Some(fd) = created.fd
            && let Err(e) = self.client.release(fd).await
        {
            debug!(path, fd, error = %e, "Release of abandoned create failed");
        }
        self.undo(path, undo).await;
    }

    pub async fn mkdir(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        caller: Option<Caller>,
    ) -> FsResult<NodeInfo> {
        let path = self.child_path_of(parent, name)?;
        trace!(path = %path, mode = format_args!("{mode:o}"), "mkdir");
        let ops = self.clone();
        let target = path.clone();
        let pending = self.spawn_create(&path, Undo::RmDir, async move {
            ops.client.mkdir(&target, mode).await?;
            let stat = ops.verify_created(&target, Undo::RmDir, caller).await?;
            Ok(Created { stat, fd: None })
        });
        let created = Self::finish_create(pending).await?;
        Ok(self.link(parent, name, &created.stat))
    }

    pub async fn mknod(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        rdev: u32,
        caller: Option<Caller>,
    ) -> FsResult<NodeInfo> {
        let path = self.child_path_of(parent, name)?;
        trace!(path = %path, mode = format_args!("{mode:o}"), rdev, "mknod");
        let ops = self.clone();
        let target = path.clone();
        let pending = self.spawn_create(&path, Undo::Unlink, async move {
            ops.client.mknod(&target, mode, rdev).await?;
            let stat = ops.verify_created(&target, Undo::Unlink, caller).await?;
            Ok(Created { stat, fd: None })
        });
        let created = Self::finish_create(pending).await?;
        Ok(self.link(parent, name, &created.stat))
    }

    /// Creates a symlink named `name` in `parent` pointing at `target`.
    pub async fn symlink(
        &self,
        parent: u64,
        name: &str,
        target: &str,
        caller: Option<Caller>,
    ) -> FsResult<NodeInfo> {
        let path = self.child_path_of(parent, name)?;
        trace!(path = %path, target, "symlink");
        let ops = self.clone();
        let link_path = path.clone();
        let target = target.to_string();
        let pending = self.spawn_create(&path, Undo::Unlink, async move {
            ops.client.symlink(&target, &link_path).await?;
            let stat = ops.verify_created(&link_path, Undo::Unlink, caller).await?;
            Ok(Created { stat, fd: None })
        });
        let created = Self::finish_create(pending).await?;
        Ok(self.link(parent, name, &created.stat))
    }

    /// Creates and opens a regular file. Returns the node and its file handle.
    pub async fn create(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        flags: i32,
        caller: Option<Caller>,
    ) -> FsResult<(NodeInfo, u64)> {
        let path = self.child_path_of(parent, name)?;
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        trace!(path = %path, mode = format_args!("{mode:o}"), flags, "create");
        let ops = self.clone();
        let target = path.clone();
        let pending = self.spawn_create(&path, Undo::Unlink, async move {
            ops.client.mknod(&target, mode, 0).await?;
            let stat = ops.verify_created(&target, Undo::Unlink, caller).await?;
            match ops.client.open(&target, flags & !libc::O_APPEND).await {
                Ok(fd) => Ok(Created { stat, fd: Some(fd) }),
                Err(e) => {
                    debug!(path = %target, error = %e, "Open after create failed");
                    ops.undo(&target, Undo::Unlink).await;
                    Err(Errno::from(e))
                }
            }
        });
        let created = Self::finish_create(pending).await?;
        let Some(fd) = created.fd else {
            return Err(Errno::EIO);
        };
        let node = self.link(parent, name, &created.stat);
        let fh = self
            .handles
            .insert(OpenHandle::File(Arc::new(RemoteFile::new(path, fd))));
        Ok((node, fh))
    }

    pub async fn unlink(&self, parent: u64, name: &str) -> FsResult<()> {
        let path = self.child_path_of(parent, name)?;
        self.client.unlink(&path).await?;
        self.tree.remove_child(parent, name);
        Ok(())
    }

    pub async fn rmdir(&self, parent: u64, name: &str) -> FsResult<()> {
        let path = self.child_path_of(parent, name)?;
        self.client.rmdir(&path).await?;
        self.tree.remove_child(parent, name);
        Ok(())
    }

    /// Renames an entry. Exchange and no-replace flags are not supported.
    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
        flags: u32,
    ) -> FsResult<()> {
        if flags != 0 {
            return Err(Errno::EINVAL);
        }
        let from = self.child_path_of(parent, name)?;
        let to = self.child_path_of(new_parent, new_name)?;
        self.client.rename(&from, &to).await?;
        self.tree.rename(parent, name, new_parent, new_name);
        Ok(())
    }

    /// Opens a file. `O_APPEND` is stripped: writes always carry offsets.
    pub async fn open(&self, ino: u64, flags: i32) -> FsResult<u64> {
        let path = self.path_of(ino)?;
        let fd = self.client.open(&path, flags & !libc::O_APPEND).await?;
        trace!(ino, path = %path, fd, "open");
        Ok(self
            .handles
            .insert(OpenHandle::File(Arc::new(RemoteFile::new(path, fd)))))
    }

    pub async fn read(&self, fh: u64, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        let file = self.file(fh)?;
        let fd = file.fd()?;
        Ok(self.client.read(fd, offset, size).await?)
    }

    pub async fn write(&self, fh: u64, offset: i64, data: &[u8]) -> FsResult<u32> {
        let file = self.file(fh)?;
        let fd = file.fd()?;
        Ok(self.client.write(fd, data, offset).await?)
    }

    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        let file = self.file(fh)?;
        let fd = file.fd()?;
        Ok(self.client.flush(file.path(), fd).await?)
    }

    pub async fn fsync(&self, fh: u64) -> FsResult<()> {
        let file = self.file(fh)?;
        let fd = file.fd()?;
        Ok(self.client.fsync(file.path(), fd).await?)
    }

    /// Closes the remote descriptor behind `fh`.
    ///
    /// A handle is released at most once. Later releases fail with `EBADF`
    /// without reaching the backend.
    pub async fn release(&self, fh: u64) -> FsResult<()> {
        let file = self.file(fh)?;
        let fd = file.take_fd()?;
        self.handles.remove(fh);
        Ok(self.client.release(fd).await?)
    }

    pub async fn getxattr(&self, ino: u64, name: &str) -> FsResult<Vec<u8>> {
        let path = self.path_of(ino)?;
        let value = self.client.get_xattr(&path, name).await?;
        Ok(value.into_bytes())
    }

    /// Sets an attribute. Values must be UTF-8 to cross the wire.
    pub async fn setxattr(&self, ino: u64, name: &str, value: &[u8]) -> FsResult<()> {
        let path = self.path_of(ino)?;
        let value = std::str::from_utf8(value).map_err(|_| Errno::EINVAL)?;
        Ok(self.client.set_xattr(&path, name, value).await?)
    }

    pub async fn removexattr(&self, ino: u64, name: &str) -> FsResult<()> {
        let path = self.path_of(ino)?;
        Ok(self.client.remove_xattr(&path, name).await?)
    }

    /// NUL-terminated attribute names from the object's record.
    pub async fn listxattr(&self, ino: u64) -> FsResult<Vec<u8>> {
        let path = self.path_of(ino)?;
        let stat = self.client.stat(&path).await?;
        let mut out = Vec::new();
        for attr in &stat.xattrs {
            out.extend_from_slice(attr.key.as_bytes());
            out.push(0);
        }
        Ok(out)
    }

    /// Copies a byte range between two files opened through this adapter.
    ///
    /// Handles of any other kind are rejected with `ENOTSUP`. At most
    /// [`MAX_COPY_LEN`] bytes are requested so the count fits the reply.
    pub async fn copy_file_range(
        &self,
        fh_in: u64,
        offset_in: i64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
    ) -> FsResult<u64> {
        let (Some(src), Some(dst)) = (self.handles.get(fh_in), self.handles.get(fh_out)) else {
            return Err(Errno::EBADF);
        };
        let (OpenHandle::File(src), OpenHandle::File(dst)) = (src, dst) else {
            return Err(Errno::ENOTSUP);
        };
        Ok(self
            .client
            .copy_extent(
                src.path(),
                dst.path(),
                offset_in,
                offset_out,
                len.min(MAX_COPY_LEN),
            )
            .await?)
    }

    pub async fn statfs(&self) -> FsResult<FsStats> {
        Ok(self.client.stat_fs().await?)
    }

    /// Opens a directory stream on a path.
    pub async fn open_stream(&self, path: String) -> FsResult<DirStream> {
        DirStream::open(Arc::clone(&self.client), path).await
    }

    /// Verifies the directory and opens a stream on it.
    pub async fn opendir(&self, ino: u64) -> FsResult<u64> {
        let path = self.path_of(ino)?;
        let stream = self.open_stream(path.clone()).await?;
        trace!(ino, path = %path, "opendir");
        Ok(self
            .handles
            .insert(OpenHandle::Dir(Arc::new(DirHandle::new(ino, path, stream)))))
    }

    pub fn releasedir(&self, fh: u64) -> FsResult<()> {
        let dir = self.dir(fh)?;
        self.handles.remove(fh);
        dir.state.lock().stream.close();
        Ok(())
    }

    /// Kernel inode of the parent directory of `ino`.
    pub fn parent_of(&self, ino: u64) -> u64 {
        if ino == ROOT_INODE {
            return ROOT_INODE;
        }
        self.tree.parent(ino).unwrap_or(ROOT_INODE)
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.tree.forget(ino, nlookup);
    }
}
