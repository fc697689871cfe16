//! Conversion between remote metadata and kernel attributes.
//!
//! Remote records carry epoch-millisecond times and service-specific block
//! accounting. The kernel always sees `blocks = size / 512` with a 512-byte
//! block size, except on the directory-entry path (`readdirplus`), which
//! reports 4096-byte pages instead. The remote `blocks`/`blksize` values are
//! never passed through.
//!
//! The reverse direction ([`SetAttrRequest::apply`]) issues exactly one remote
//! call per requested field group and then re-reads the authoritative record.

use crate::error::FsResult;
use fuser::{FileAttr, FileType, TimeOrNow};
use remfs_client::{RemoteClient, S_IFDIR, S_IFLNK, S_IFMT, Stat};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Block size reported on regular attribute calls.
pub const BLOCK_SIZE: u32 = 512;

/// Page size used for the directory-entry block estimate.
pub const PAGE_SIZE: u32 = 4096;

const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

/// Sentinel telling the remote service to leave a slot unchanged.
pub const UNCHANGED: i64 = -1;

/// Converts epoch milliseconds (possibly negative) to a [`SystemTime`].
pub fn ms_to_system_time(ms: i64) -> SystemTime {
    let magnitude = Duration::from_millis(ms.unsigned_abs());
    if ms >= 0 {
        UNIX_EPOCH + magnitude
    } else {
        UNIX_EPOCH.checked_sub(magnitude).unwrap_or(UNIX_EPOCH)
    }
}

/// Converts a [`SystemTime`] to epoch milliseconds, truncating sub-millisecond precision.
pub fn system_time_to_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Maps the file type bits of a mode word.
pub fn kind_from_mode(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFCHR => FileType::CharDevice,
        S_IFBLK => FileType::BlockDevice,
        S_IFIFO => FileType::NamedPipe,
        S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Builds kernel attributes for `ino` from a remote record.
pub fn stat_to_attr(stat: &Stat, ino: u64) -> FileAttr {
    let kind = kind_from_mode(stat.mode);
    let ctime = ms_to_system_time(stat.ctime);
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size / u64::from(BLOCK_SIZE),
        atime: ms_to_system_time(stat.atime),
        mtime: ms_to_system_time(stat.mtime),
        ctime,
        crtime: ctime,
        kind,
        perm: (stat.mode & 0o7777) as u16,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Rewrites block accounting to whole 4096-byte pages counted in 512-byte units.
pub fn apply_page_estimate(attr: &mut FileAttr) {
    let pages = attr.size.div_ceil(u64::from(PAGE_SIZE));
    attr.blksize = PAGE_SIZE;
    attr.blocks = pages * u64::from(PAGE_SIZE / BLOCK_SIZE);
}

/// Kernel attributes for the directory-entry path.
pub fn entry_attr(stat: &Stat, ino: u64) -> FileAttr {
    let mut attr = stat_to_attr(stat, ino);
    apply_page_estimate(&mut attr);
    attr
}

fn time_or_now_ms(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(time) => system_time_to_ms(time),
        TimeOrNow::Now => system_time_to_ms(SystemTime::now()),
    }
}

/// Fields of a kernel `setattr` request that map to remote calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

impl SetAttrRequest {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }

    /// Applies the request to `path` and returns the re-fetched record.
    ///
    /// Order is chmod, chown, utime, truncate. The first failing call aborts
    /// the rest and its error is returned.
    pub async fn apply(&self, client: &dyn RemoteClient, path: &str) -> FsResult<Stat> {
        if let Some(mode) = self.mode {
            trace!(path, mode = format_args!("{mode:o}"), "chmod");
            client.chmod(path, mode & 0o7777).await?;
        }
        if self.uid.is_some() || self.gid.is_some() {
            let uid = self.uid.map_or(UNCHANGED, i64::from);
            let gid = self.gid.map_or(UNCHANGED, i64::from);
            trace!(path, uid, gid, "chown");
            client.chown(path, uid, gid).await?;
        }
        if self.atime.is_some() || self.mtime.is_some() {
            let atime = self.atime.map_or(UNCHANGED, time_or_now_ms);
            let mtime = self.mtime.map_or(UNCHANGED, time_or_now_ms);
            trace!(path, atime, mtime, "utime");
            client.utime(path, atime, mtime).await?;
        }
        if let Some(size) = self.size {
            trace!(path, size, "truncate");
            client.truncate(path, size as i64).await?;
        }
        Ok(client.get_attr(path).await?)
    }
}
