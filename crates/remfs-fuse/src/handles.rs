//! Open file and directory handles.
//!
//! Handles live in a [`HandleTable`] keyed by auto-incrementing ids that are
//! handed to the kernel as `fh`. File handles wrap a remote descriptor behind
//! a mutex so that release happens at most once; directory handles own the
//! [`DirStream`] plus the readdir position.

use crate::dirstream::{DirEntry, DirStream};
use crate::error::{Errno, FsResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe table with auto-incrementing ids.
///
/// Ids start at 1; 0 is never handed out.
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a value and returns its new id.
    pub fn insert(&self, value: V) -> u64 {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == 0 || self.handles.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        self.handles.insert(id, value);
        id
    }

    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<V: Clone> HandleTable<V> {
    /// Returns a clone of the value, releasing the shard lock immediately.
    pub fn get(&self, id: u64) -> Option<V> {
        self.handles.get(&id).map(|r| r.value().clone())
    }
}

/// An open remote file.
#[derive(Debug)]
pub struct RemoteFile {
    /// Remote path at open time, used for path-keyed calls.
    path: String,
    fd: Mutex<Option<i64>>,
}

impl RemoteFile {
    pub fn new(path: String, fd: i64) -> Self {
        Self {
            path,
            fd: Mutex::new(Some(fd)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the descriptor, or `EBADF` once released.
    pub fn fd(&self) -> FsResult<i64> {
        (*self.fd.lock()).ok_or(Errno::EBADF)
    }

    /// Marks the handle released and returns the descriptor to close.
    ///
    /// Only the first call succeeds; later calls get `EBADF`.
    pub fn take_fd(&self) -> FsResult<i64> {
        self.fd.lock().take().ok_or(Errno::EBADF)
    }
}

/// Readdir position of a directory handle.
#[derive(Debug)]
pub struct DirState {
    pub stream: Arc<DirStream>,
    /// Offset of the last entry handed to the kernel (0 = nothing yet).
    pub delivered: i64,
    /// Entry fetched from the stream but rejected by a full reply buffer.
    pub parked: Option<DirEntry>,
}

/// An open remote directory.
#[derive(Debug)]
pub struct DirHandle {
    /// Kernel inode of the directory.
    pub ino: u64,
    pub path: String,
    pub state: Mutex<DirState>,
}

impl DirHandle {
    pub fn new(ino: u64, path: String, stream: DirStream) -> Self {
        Self {
            ino,
            path,
            state: Mutex::new(DirState {
                stream: Arc::new(stream),
                delivered: 0,
                parked: None,
            }),
        }
    }
}

/// Anything the kernel can hold an `fh` for.
#[derive(Debug, Clone)]
pub enum OpenHandle {
    File(Arc<RemoteFile>),
    Dir(Arc<DirHandle>),
}

impl OpenHandle {
    pub fn as_file(&self) -> Option<&Arc<RemoteFile>> {
        match self {
            OpenHandle::File(f) => Some(f),
            OpenHandle::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&Arc<DirHandle>> {
        match self {
            OpenHandle::Dir(d) => Some(d),
            OpenHandle::File(_) => None,
        }
    }
}

pub type OpenHandleTable = HandleTable<OpenHandle>;
