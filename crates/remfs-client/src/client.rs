//! The remote service capability set.

use crate::error::RemoteResult;
use crate::types::{DirPage, FsStats, Stat, VolumeInfo};
use async_trait::async_trait;
use std::fmt;

/// One remote capability, used for call logs and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Stat,
    GetAttr,
    ListDir,
    MkDir,
    MkNod,
    SymLink,
    ReadLink,
    Rename,
    Unlink,
    RmDir,
    Open,
    Read,
    Write,
    Flush,
    Fsync,
    Release,
    Truncate,
    Chmod,
    Chown,
    Utime,
    GetXAttr,
    SetXAttr,
    RemoveXAttr,
    CopyExtent,
    StatFs,
    GetVolumeInfo,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Client for the remote storage service.
///
/// Every method takes an explicit absolute remote path or a descriptor
/// previously returned by [`open`](RemoteClient::open). Implementations are
/// shared by every concurrent filesystem request and must be safe for
/// concurrent use. They own their own timeout and retry policy; callers treat
/// every error as terminal.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Checks existence and returns metadata.
    async fn stat(&self, path: &str) -> RemoteResult<Stat>;

    /// Returns authoritative metadata for a path.
    async fn get_attr(&self, path: &str) -> RemoteResult<Stat>;

    /// Lists up to `limit` entries of `path` strictly after `marker`.
    ///
    /// An empty marker starts at the beginning.
    async fn list_dir(
        &self,
        path: &str,
        marker: &str,
        recursive: bool,
        limit: u32,
    ) -> RemoteResult<DirPage>;

    async fn mkdir(&self, path: &str, mode: u32) -> RemoteResult<()>;

    async fn mknod(&self, path: &str, mode: u32, rdev: u32) -> RemoteResult<()>;

    /// Creates a symbolic link at `link_path` pointing to `target`.
    async fn symlink(&self, target: &str, link_path: &str) -> RemoteResult<()>;

    async fn read_link(&self, path: &str) -> RemoteResult<String>;

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()>;

    /// Deletes a non-directory object.
    async fn unlink(&self, path: &str) -> RemoteResult<()>;

    async fn rmdir(&self, path: &str) -> RemoteResult<()>;

    /// Opens a file and returns a remote descriptor.
    async fn open(&self, path: &str, flags: i32) -> RemoteResult<i64>;

    async fn read(&self, fd: i64, offset: i64, len: u32) -> RemoteResult<Vec<u8>>;

    /// Writes `data` at `offset`, returning the number of bytes written.
    async fn write(&self, fd: i64, data: &[u8], offset: i64) -> RemoteResult<u32>;

    async fn flush(&self, path: &str, fd: i64) -> RemoteResult<()>;

    async fn fsync(&self, path: &str, fd: i64) -> RemoteResult<()>;

    async fn release(&self, fd: i64) -> RemoteResult<()>;

    async fn truncate(&self, path: &str, size: i64) -> RemoteResult<()>;

    async fn chmod(&self, path: &str, mode: u32) -> RemoteResult<()>;

    /// Changes ownership. A `-1` slot leaves that id unchanged.
    async fn chown(&self, path: &str, uid: i64, gid: i64) -> RemoteResult<()>;

    /// Sets timestamps in epoch milliseconds. A `-1` slot leaves that time unchanged.
    async fn utime(&self, path: &str, atime_ms: i64, mtime_ms: i64) -> RemoteResult<()>;

    async fn get_xattr(&self, path: &str, name: &str) -> RemoteResult<String>;

    async fn set_xattr(&self, path: &str, name: &str, value: &str) -> RemoteResult<()>;

    async fn remove_xattr(&self, path: &str, name: &str) -> RemoteResult<()>;

    /// Copies `len` bytes between two remote files without moving data
    /// through the client. Returns the number of bytes copied.
    async fn copy_extent(
        &self,
        src: &str,
        dst: &str,
        src_offset: i64,
        dst_offset: i64,
        len: u64,
    ) -> RemoteResult<u64>;

    async fn stat_fs(&self) -> RemoteResult<FsStats>;

    async fn volume_info(&self) -> RemoteResult<VolumeInfo>;
}
