//! In-process implementation of the remote service.
//!
//! [`MemoryRemote`] keeps a namespace of paths over a table of objects keyed
//! by device id. It exists for tests and the `mem://` scheme, so it also
//! records every call it receives and lets callers inject failures into the
//! next call of a given capability.

use crate::client::{Capability, RemoteClient};
use crate::error::{RemoteError, RemoteResult};
use crate::types::{DirPage, FsStats, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, Stat, VolumeInfo, XAttr};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Serial number reported for the volume when none is configured.
pub const DEFAULT_SERIAL: u64 = 7001;

/// Capacity reported for the volume when none is configured (1 GiB).
pub const DEFAULT_CAPACITY: u64 = 1 << 30;

const BLOCK: u64 = 4096;

/// A recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub capability: Capability,
    /// Path argument, or the descriptor rendered as `fd:<n>` for descriptor calls.
    pub path: String,
}

#[derive(Debug, Clone)]
enum FaultKind {
    Status(i32),
    Transport,
}

#[derive(Debug, Clone)]
struct Fault {
    capability: Capability,
    path: Option<String>,
    kind: FaultKind,
}

#[derive(Debug)]
struct Object {
    stat: Stat,
    data: Vec<u8>,
    target: String,
}

#[derive(Debug)]
struct OpenFile {
    dev: u64,
    flags: i32,
}

#[derive(Debug)]
struct State {
    names: BTreeMap<String, u64>,
    objects: HashMap<u64, Object>,
    fds: HashMap<i64, OpenFile>,
    next_fd: i64,
    next_dev: u64,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    delays: Vec<(Capability, Duration)>,
    last_open_flags: Option<i32>,
    last_copy_len: Option<u64>,
}

/// In-memory remote service.
#[derive(Debug)]
pub struct MemoryRemote {
    name: String,
    serial: u64,
    capacity: u64,
    owner: (u32, u32),
    state: Mutex<State>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Splits an absolute path into its parent and final segment.
fn split(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

fn invalid(path: &str) -> RemoteError {
    RemoteError::status(libc::EINVAL, format!("invalid path: {path}"))
}

fn exists(path: &str) -> RemoteError {
    RemoteError::status(libc::EEXIST, format!("file exists: {path}"))
}

fn is_dir(path: &str) -> RemoteError {
    RemoteError::status(libc::EISDIR, format!("is a directory: {path}"))
}

fn not_dir(path: &str) -> RemoteError {
    RemoteError::status(libc::ENOTDIR, format!("not a directory: {path}"))
}

fn bad_fd(fd: i64) -> RemoteError {
    RemoteError::status(libc::EBADF, format!("bad descriptor: {fd}"))
}

fn too_big(what: &str) -> RemoteError {
    RemoteError::status(libc::EFBIG, format!("extent beyond volume capacity: {what}"))
}

fn blocks_for(size: u64) -> u64 {
    size.div_ceil(BLOCK)
}

impl State {
    fn dev_of(&self, path: &str) -> RemoteResult<u64> {
        self.names
            .get(path)
            .copied()
            .ok_or_else(|| RemoteError::not_found(path))
    }

    fn object(&self, path: &str) -> RemoteResult<&Object> {
        let dev = self.dev_of(path)?;
        self.objects
            .get(&dev)
            .ok_or_else(|| RemoteError::not_found(path))
    }

    fn object_mut(&mut self, path: &str) -> RemoteResult<&mut Object> {
        let dev = self.dev_of(path)?;
        self.objects
            .get_mut(&dev)
            .ok_or_else(|| RemoteError::not_found(path))
    }

    fn stat_of(&self, path: &str) -> RemoteResult<Stat> {
        let obj = self.object(path)?;
        let mut stat = obj.stat.clone();
        stat.file_name = split(path).map_or_else(String::new, |(_, n)| n.to_string());
        Ok(stat)
    }

    fn file_by_fd(&mut self, fd: i64) -> RemoteResult<&mut Object> {
        let dev = self.fds.get(&fd).ok_or_else(|| bad_fd(fd))?.dev;
        self.objects.get_mut(&dev).ok_or_else(|| bad_fd(fd))
    }

    fn children<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = (&'a str, u64)> + 'a {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.names
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, dev)| {
                let rest = &k[if dir == "/" { 1 } else { dir.len() + 1 }..];
                (!rest.is_empty() && !rest.contains('/')).then_some((rest, *dev))
            })
    }

    /// Checks that `path` is free and its parent is a directory.
    fn check_new(&self, path: &str) -> RemoteResult<()> {
        let (parent, _) = split(path).ok_or_else(|| invalid(path))?;
        if !self.object(parent)?.stat.is_dir() {
            return Err(not_dir(parent));
        }
        if self.names.contains_key(path) {
            return Err(exists(path));
        }
        Ok(())
    }

    fn insert(&mut self, path: &str, mode: u32, owner: (u32, u32), target: String) {
        let dev = self.next_dev;
        self.next_dev += 1;
        let now = now_ms();
        let size = target.len() as u64;
        let stat = Stat {
            file_name: String::new(),
            mode,
            size,
            uid: owner.0,
            gid: owner.1,
            dev,
            blksize: BLOCK,
            blocks: blocks_for(size),
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: Vec::new(),
        };
        self.objects.insert(
            dev,
            Object {
                stat,
                data: Vec::new(),
                target,
            },
        );
        self.names.insert(path.to_string(), dev);
        self.touch_parent(path);
    }

    fn touch_parent(&mut self, path: &str) {
        if let Some((parent, _)) = split(path)
            && let Ok(obj) = self.object_mut(parent)
        {
            let now = now_ms();
            obj.stat.mtime = now;
            obj.stat.ctime = now;
        }
    }

    fn used_bytes(&self) -> u64 {
        self.objects.values().map(|o| o.stat.size).sum()
    }
}

impl Object {
    fn resize(&mut self, size: usize) {
        self.data.resize(size, 0);
        self.stat.size = size as u64;
        self.stat.blocks = blocks_for(self.stat.size);
        let now = now_ms();
        self.stat.mtime = now;
        self.stat.ctime = now;
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if end > self.data.len() {
            self.resize(end);
        }
        self.data[offset..end].copy_from_slice(data);
        let now = now_ms();
        self.stat.mtime = now;
        self.stat.ctime = now;
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates an empty volume named `memory` owned by root.
    pub fn new() -> Self {
        Self::build("memory".to_string(), DEFAULT_SERIAL, DEFAULT_CAPACITY, (0, 0))
    }

    /// Creates an empty volume with the given name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::build(name.into(), DEFAULT_SERIAL, DEFAULT_CAPACITY, (0, 0))
    }

    /// Sets the volume serial number, which is also the root device id.
    #[must_use]
    pub fn serial(self, serial: u64) -> Self {
        Self::build(self.name, serial, self.capacity, self.owner)
    }

    /// Sets the owner assigned to newly created objects.
    #[must_use]
    pub fn owner(self, uid: u32, gid: u32) -> Self {
        Self::build(self.name, self.serial, self.capacity, (uid, gid))
    }

    #[must_use]
    pub fn capacity(self, capacity: u64) -> Self {
        Self::build(self.name, self.serial, capacity, self.owner)
    }

    fn build(name: String, serial: u64, capacity: u64, owner: (u32, u32)) -> Self {
        let mut state = State {
            names: BTreeMap::new(),
            objects: HashMap::new(),
            fds: HashMap::new(),
            next_fd: 3,
            next_dev: serial,
            calls: Vec::new(),
            faults: Vec::new(),
            delays: Vec::new(),
            last_open_flags: None,
            last_copy_len: None,
        };
        state.insert("/", S_IFDIR | 0o755, owner, String::new());
        // Object ids continue after a gap so they never collide with the root.
        state.next_dev = serial.saturating_add(100);
        Self {
            name,
            serial,
            capacity,
            owner,
            state: Mutex::new(state),
        }
    }

    /// Fails the next call of `capability` with the given POSIX code.
    pub fn fail_next(&self, capability: Capability, code: i32) {
        self.state.lock().faults.push(Fault {
            capability,
            path: None,
            kind: FaultKind::Status(code),
        });
    }

    /// Fails the next call of `capability` on `path` with the given POSIX code.
    pub fn fail_next_at(&self, capability: Capability, path: &str, code: i32) {
        self.state.lock().faults.push(Fault {
            capability,
            path: Some(path.to_string()),
            kind: FaultKind::Status(code),
        });
    }

    /// Fails the next call of `capability` with a transport error.
    pub fn fail_next_transport(&self, capability: Capability) {
        self.state.lock().faults.push(Fault {
            capability,
            path: None,
            kind: FaultKind::Transport,
        });
    }

    /// Holds the next call of `capability` for `delay` before serving it.
    pub fn delay_next(&self, capability: Capability, delay: Duration) {
        self.state.lock().delays.push((capability, delay));
    }

    /// Returns every call received so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Returns the path argument of every call of `capability`, in order.
    pub fn calls_for(&self, capability: Capability) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.capability == capability)
            .map(|c| c.path.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Flags passed to the most recent successful open.
    pub fn last_open_flags(&self) -> Option<i32> {
        self.state.lock().last_open_flags
    }

    /// Length requested by the most recent copy_extent call.
    pub fn last_copy_len(&self) -> Option<u64> {
        self.state.lock().last_copy_len
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        self.state.lock().fds.len()
    }

    /// Returns true if `path` names an object.
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().names.contains_key(path)
    }

    /// Returns a copy of a file's contents.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.object(path).ok().map(|o| o.data.clone())
    }

    /// Sleeps for a pending injected delay on `capability`, if any.
    async fn stall(&self, capability: Capability) {
        let delay = {
            let mut state = self.state.lock();
            let hit = state.delays.iter().position(|(c, _)| *c == capability);
            hit.map(|i| state.delays.remove(i).1)
        };
        if let Some(delay) = delay {
            debug!(capability = %capability, ?delay, "Injected remote delay");
            tokio::time::sleep(delay).await;
        }
    }

    /// Fails with `EFBIG` when `offset + len` would grow a file past the
    /// volume capacity.
    fn check_extent(&self, offset: u64, len: u64, what: &str) -> RemoteResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(too_big(what)),
        }
    }

    /// Records the call and consumes a matching injected fault.
    fn begin(&self, state: &mut State, capability: Capability, path: &str) -> RemoteResult<()> {
        state.calls.push(Call {
            capability,
            path: path.to_string(),
        });
        let hit = state.faults.iter().position(|f| {
            f.capability == capability && f.path.as_deref().is_none_or(|p| p == path)
        });
        match hit.map(|i| state.faults.remove(i)) {
            None => Ok(()),
            Some(fault) => {
                debug!(capability = %capability, path, "Injected remote fault");
                match fault.kind {
                    FaultKind::Status(code) => {
                        Err(RemoteError::status(code, format!("injected {capability} failure")))
                    }
                    FaultKind::Transport => Err(RemoteError::Transport(format!(
                        "injected {capability} transport failure"
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn stat(&self, path: &str) -> RemoteResult<Stat> {
        self.stall(Capability::Stat).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Stat, path)?;
        state.stat_of(path)
    }

    async fn get_attr(&self, path: &str) -> RemoteResult<Stat> {
        self.stall(Capability::GetAttr).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::GetAttr, path)?;
        state.stat_of(path)
    }

    /// Lists direct children in name order. The returned marker is the name
    /// of the last entry, or empty when nothing is left.
    async fn list_dir(
        &self,
        path: &str,
        marker: &str,
        _recursive: bool,
        limit: u32,
    ) -> RemoteResult<DirPage> {
        self.stall(Capability::ListDir).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::ListDir, path)?;
        if !state.object(path)?.stat.is_dir() {
            return Err(not_dir(path));
        }
        let mut entries = Vec::new();
        for (name, dev) in state.children(path) {
            if entries.len() >= limit as usize {
                break;
            }
            if !marker.is_empty() && name <= marker {
                continue;
            }
            if let Some(obj) = state.objects.get(&dev) {
                let mut stat = obj.stat.clone();
                stat.file_name = name.to_string();
                entries.push(stat);
            }
        }
        let marker = entries
            .last()
            .map_or_else(String::new, |s| s.file_name.clone());
        Ok(DirPage { marker, entries })
    }

    async fn mkdir(&self, path: &str, mode: u32) -> RemoteResult<()> {
        self.stall(Capability::MkDir).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::MkDir, path)?;
        state.check_new(path)?;
        state.insert(path, S_IFDIR | (mode & 0o7777), self.owner, String::new());
        Ok(())
    }

    async fn mknod(&self, path: &str, mode: u32, _rdev: u32) -> RemoteResult<()> {
        self.stall(Capability::MkNod).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::MkNod, path)?;
        state.check_new(path)?;
        let kind = match mode & S_IFMT {
            0 => S_IFREG,
            S_IFDIR => return Err(invalid(path)),
            other => other,
        };
        state.insert(path, kind | (mode & 0o7777), self.owner, String::new());
        Ok(())
    }

    async fn symlink(&self, target: &str, link_path: &str) -> RemoteResult<()> {
        self.stall(Capability::SymLink).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::SymLink, link_path)?;
        state.check_new(link_path)?;
        state.insert(link_path, S_IFLNK | 0o777, self.owner, target.to_string());
        Ok(())
    }

    async fn read_link(&self, path: &str) -> RemoteResult<String> {
        self.stall(Capability::ReadLink).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::ReadLink, path)?;
        let obj = state.object(path)?;
        if !obj.stat.is_symlink() {
            return Err(invalid(path));
        }
        Ok(obj.target.clone())
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        self.stall(Capability::Rename).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Rename, from)?;
        let src_is_dir = state.object(from)?.stat.is_dir();
        if from == to {
            return Ok(());
        }
        if src_is_dir && to.starts_with(&format!("{from}/")) {
            return Err(invalid(to));
        }
        let (parent, _) = split(to).ok_or_else(|| invalid(to))?;
        if !state.object(parent)?.stat.is_dir() {
            return Err(not_dir(parent));
        }
        if let Ok(dst) = state.object(to) {
            match (src_is_dir, dst.stat.is_dir()) {
                (true, false) => return Err(not_dir(to)),
                (false, true) => return Err(is_dir(to)),
                (true, true) if state.children(to).next().is_some() => {
                    return Err(RemoteError::status(
                        libc::ENOTEMPTY,
                        format!("directory not empty: {to}"),
                    ));
                }
                _ => {}
            }
            state.names.remove(to);
        }

        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = state
            .names
            .iter()
            .filter(|(k, _)| k.as_str() == from || k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (old, dev) in moved {
            state.names.remove(&old);
            let new = format!("{to}{}", &old[from.len()..]);
            state.names.insert(new, dev);
        }
        state.touch_parent(from);
        state.touch_parent(to);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> RemoteResult<()> {
        self.stall(Capability::Unlink).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Unlink, path)?;
        if state.object(path)?.stat.is_dir() {
            return Err(is_dir(path));
        }
        if let Some(dev) = state.names.remove(path)
            && !state.fds.values().any(|f| f.dev == dev)
        {
            state.objects.remove(&dev);
        }
        state.touch_parent(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> RemoteResult<()> {
        self.stall(Capability::RmDir).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::RmDir, path)?;
        if path == "/" {
            return Err(RemoteError::status(libc::EBUSY, "cannot remove root"));
        }
        if !state.object(path)?.stat.is_dir() {
            return Err(not_dir(path));
        }
        if state.children(path).next().is_some() {
            return Err(RemoteError::status(
                libc::ENOTEMPTY,
                format!("directory not empty: {path}"),
            ));
        }
        if let Some(dev) = state.names.remove(path) {
            state.objects.remove(&dev);
        }
        state.touch_parent(path);
        Ok(())
    }

    async fn open(&self, path: &str, flags: i32) -> RemoteResult<i64> {
        self.stall(Capability::Open).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Open, path)?;
        let dev = state.dev_of(path)?;
        let obj = state.object_mut(path)?;
        if obj.stat.is_dir() {
            return Err(is_dir(path));
        }
        if flags & libc::O_TRUNC != 0 {
            obj.resize(0);
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, OpenFile { dev, flags });
        state.last_open_flags = Some(flags);
        Ok(fd)
    }

    async fn read(&self, fd: i64, offset: i64, len: u32) -> RemoteResult<Vec<u8>> {
        self.stall(Capability::Read).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Read, &format!("fd:{fd}"))?;
        if offset < 0 {
            return Err(RemoteError::status(libc::EINVAL, "negative offset"));
        }
        let obj = state.file_by_fd(fd)?;
        let start = (offset as usize).min(obj.data.len());
        let end = start.saturating_add(len as usize).min(obj.data.len());
        obj.stat.atime = now_ms();
        Ok(obj.data[start..end].to_vec())
    }

    async fn write(&self, fd: i64, data: &[u8], offset: i64) -> RemoteResult<u32> {
        self.stall(Capability::Write).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Write, &format!("fd:{fd}"))?;
        if offset < 0 {
            return Err(RemoteError::status(libc::EINVAL, "negative offset"));
        }
        let flags = state.fds.get(&fd).ok_or_else(|| bad_fd(fd))?.flags;
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            return Err(bad_fd(fd));
        }
        self.check_extent(offset as u64, data.len() as u64, &format!("fd:{fd}"))?;
        let obj = state.file_by_fd(fd)?;
        obj.write_at(offset as usize, data);
        Ok(data.len() as u32)
    }

    async fn flush(&self, path: &str, fd: i64) -> RemoteResult<()> {
        self.stall(Capability::Flush).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Flush, path)?;
        state.file_by_fd(fd).map(|_| ())
    }

    async fn fsync(&self, path: &str, fd: i64) -> RemoteResult<()> {
        self.stall(Capability::Fsync).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Fsync, path)?;
        state.file_by_fd(fd).map(|_| ())
    }

    async fn release(&self, fd: i64) -> RemoteResult<()> {
        self.stall(Capability::Release).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Release, &format!("fd:{fd}"))?;
        let file = state.fds.remove(&fd).ok_or_else(|| bad_fd(fd))?;
        // Drop data of unlinked objects once the last descriptor goes away.
        let linked = state.names.values().any(|d| *d == file.dev);
        let open = state.fds.values().any(|f| f.dev == file.dev);
        if !linked && !open {
            state.objects.remove(&file.dev);
        }
        Ok(())
    }

    async fn truncate(&self, path: &str, size: i64) -> RemoteResult<()> {
        self.stall(Capability::Truncate).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Truncate, path)?;
        let size = u64::try_from(size).map_err(|_| invalid(path))?;
        self.check_extent(size, 0, path)?;
        let obj = state.object_mut(path)?;
        if obj.stat.is_dir() {
            return Err(is_dir(path));
        }
        obj.resize(size as usize);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> RemoteResult<()> {
        self.stall(Capability::Chmod).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Chmod, path)?;
        let obj = state.object_mut(path)?;
        obj.stat.mode = (obj.stat.mode & S_IFMT) | (mode & 0o7777);
        obj.stat.ctime = now_ms();
        Ok(())
    }

    async fn chown(&self, path: &str, uid: i64, gid: i64) -> RemoteResult<()> {
        self.stall(Capability::Chown).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Chown, path)?;
        let obj = state.object_mut(path)?;
        if uid >= 0 {
            obj.stat.uid = uid as u32;
        }
        if gid >= 0 {
            obj.stat.gid = gid as u32;
        }
        obj.stat.ctime = now_ms();
        Ok(())
    }

    async fn utime(&self, path: &str, atime_ms: i64, mtime_ms: i64) -> RemoteResult<()> {
        self.stall(Capability::Utime).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::Utime, path)?;
        let obj = state.object_mut(path)?;
        if atime_ms != -1 {
            obj.stat.atime = atime_ms;
        }
        if mtime_ms != -1 {
            obj.stat.mtime = mtime_ms;
        }
        obj.stat.ctime = now_ms();
        Ok(())
    }

    async fn get_xattr(&self, path: &str, name: &str) -> RemoteResult<String> {
        self.stall(Capability::GetXAttr).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::GetXAttr, path)?;
        state
            .object(path)?
            .stat
            .xattr(name)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::status(libc::ENODATA, format!("no attribute {name}")))
    }

    async fn set_xattr(&self, path: &str, name: &str, value: &str) -> RemoteResult<()> {
        self.stall(Capability::SetXAttr).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::SetXAttr, path)?;
        let obj = state.object_mut(path)?;
        match obj.stat.xattrs.iter_mut().find(|x| x.key == name) {
            Some(existing) => existing.value = value.to_string(),
            None => obj.stat.xattrs.push(XAttr::new(name, value)),
        }
        obj.stat.ctime = now_ms();
        Ok(())
    }

    async fn remove_xattr(&self, path: &str, name: &str) -> RemoteResult<()> {
        self.stall(Capability::RemoveXAttr).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::RemoveXAttr, path)?;
        let obj = state.object_mut(path)?;
        let before = obj.stat.xattrs.len();
        obj.stat.xattrs.retain(|x| x.key != name);
        if obj.stat.xattrs.len() == before {
            return Err(RemoteError::status(
                libc::ENODATA,
                format!("no attribute {name}"),
            ));
        }
        obj.stat.ctime = now_ms();
        Ok(())
    }

    async fn copy_extent(
        &self,
        src: &str,
        dst: &str,
        src_offset: i64,
        dst_offset: i64,
        len: u64,
    ) -> RemoteResult<u64> {
        self.stall(Capability::CopyExtent).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::CopyExtent, src)?;
        state.last_copy_len = Some(len);
        if src_offset < 0 || dst_offset < 0 {
            return Err(RemoteError::status(libc::EINVAL, "negative offset"));
        }
        let source = state.object(src)?;
        if source.stat.is_dir() {
            return Err(is_dir(src));
        }
        let start = (src_offset as usize).min(source.data.len());
        let end = start
            .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
            .min(source.data.len());
        let chunk = source.data[start..end].to_vec();
        self.check_extent(dst_offset as u64, chunk.len() as u64, dst)?;
        let target = state.object_mut(dst)?;
        if target.stat.is_dir() {
            return Err(is_dir(dst));
        }
        target.write_at(dst_offset as usize, &chunk);
        Ok(chunk.len() as u64)
    }

    async fn stat_fs(&self) -> RemoteResult<FsStats> {
        self.stall(Capability::StatFs).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::StatFs, "/")?;
        let used = state.used_bytes();
        Ok(FsStats {
            blocks: self.capacity / BLOCK,
            bfree: self.capacity.saturating_sub(used) / BLOCK,
            bsize: BLOCK as u32,
            namelen: 255,
        })
    }

    async fn volume_info(&self) -> RemoteResult<VolumeInfo> {
        self.stall(Capability::GetVolumeInfo).await;
        let mut state = self.state.lock();
        self.begin(&mut state, Capability::GetVolumeInfo, "/")?;
        Ok(VolumeInfo {
            serial_number: self.serial,
            name: self.name.clone(),
            capacity: self.capacity,
            current_size: state.used_bytes(),
        })
    }
}
