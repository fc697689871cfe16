//! Node tree and kernel inode identity.
//!
//! Kernel inode numbers are not allocated here: they come from the remote
//! device id of each object, so repeated lookups of the same object always
//! agree. The tree only remembers how nodes hang together (parent and name),
//! which is enough to rebuild a node's remote path on demand. It never caches
//! remote metadata.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use remfs_client::Stat;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// Parent value of a node that is no longer linked into the tree.
const DETACHED: u64 = 0;

/// Upper bound on path depth, guards against a corrupted parent chain.
const MAX_DEPTH: usize = 4096;

/// Kernel-visible identity of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableAttr {
    pub mode: u32,
    /// Remote device id of the object.
    pub ino: u64,
    /// Always 1: the remote service never reuses ids.
    pub generation: u64,
}

impl StableAttr {
    pub fn from_stat(stat: &Stat) -> Self {
        Self {
            mode: stat.mode,
            ino: stat.dev,
            generation: 1,
        }
    }
}

/// Joins a directory path and an entry name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Normalizes a remote root to `/` or `/a/b` form.
pub fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[derive(Debug)]
pub struct NodeEntry {
    parent: u64,
    name: String,
    nlookup: AtomicU64,
}

impl NodeEntry {
    fn new(parent: u64, name: String, nlookup: u64) -> Self {
        Self {
            parent,
            name,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }

    fn dec_nlookup(&self, count: u64) -> u64 {
        let mut current = self.nlookup.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.nlookup.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Parent-linked tree of nodes the kernel currently knows about.
#[derive(Debug)]
pub struct NodeTree {
    remote_root: String,
    root_dev: u64,
    nodes: DashMap<u64, NodeEntry>,
    children: DashMap<(u64, String), u64>,
}

impl NodeTree {
    /// Creates a tree whose root maps to `remote_root` with device id `root_dev`.
    pub fn new(remote_root: &str, root_dev: u64) -> Self {
        let nodes = DashMap::new();
        nodes.insert(ROOT_INODE, NodeEntry::new(ROOT_INODE, String::new(), 1));
        Self {
            remote_root: normalize_root(remote_root),
            root_dev,
            nodes,
            children: DashMap::new(),
        }
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    pub fn root_dev(&self) -> u64 {
        self.root_dev
    }

    /// Maps a remote device id to a kernel inode number.
    ///
    /// The root device becomes [`ROOT_INODE`] and a remote object with id 1
    /// takes the root device's number, so the mapping stays one-to-one.
    pub fn kernel_ino(&self, dev: u64) -> u64 {
        if dev == self.root_dev {
            ROOT_INODE
        } else if dev == ROOT_INODE {
            self.root_dev
        } else {
            dev
        }
    }

    /// Inverse of [`kernel_ino`](Self::kernel_ino).
    pub fn remote_id(&self, ino: u64) -> u64 {
        // The swap is its own inverse.
        self.kernel_ino(ino)
    }

    /// Reconstructs the absolute remote path of `ino`.
    pub fn path(&self, ino: u64) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = ino;
        while current != ROOT_INODE {
            if segments.len() >= MAX_DEPTH {
                warn!(ino, "Parent chain too deep, giving up");
                return None;
            }
            let (parent, name) = {
                let entry = self.nodes.get(&current)?;
                (entry.parent, entry.name.clone())
            };
            if parent == DETACHED {
                return None;
            }
            segments.push(name);
            current = parent;
        }
        let mut path = self.remote_root.clone();
        for name in segments.iter().rev() {
            path = join_path(&path, name);
        }
        Some(path)
    }

    /// Remote path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|p| join_path(&p, name))
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.nodes.contains_key(&ino)
    }

    /// Kernel inode currently linked at `(parent, name)`, if known.
    pub fn child(&self, parent: u64, name: &str) -> Option<u64> {
        self.children
            .get(&(parent, name.to_string()))
            .map(|r| *r)
    }

    /// Kernel inode of the directory holding `ino`, if still linked.
    pub fn parent(&self, ino: u64) -> Option<u64> {
        self.nodes
            .get(&ino)
            .map(|e| e.parent)
            .filter(|p| *p != DETACHED)
    }

    pub fn nlookup(&self, ino: u64) -> Option<u64> {
        self.nodes.get(&ino).map(|e| e.nlookup())
    }

    /// Records that the kernel resolved `name` in `parent` to the object `stat`.
    ///
    /// Returns the kernel inode and bumps its lookup count.
    pub fn insert(&self, parent: u64, name: &str, stat: &Stat) -> u64 {
        let ino = self.kernel_ino(stat.dev);
        if ino == ROOT_INODE {
            return ino;
        }
        let key = (parent, name.to_string());
        match self.nodes.entry(ino) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.nlookup.fetch_add(1, Ordering::Relaxed);
                if entry.parent != parent || entry.name != name {
                    let stale = (entry.parent, std::mem::take(&mut entry.name));
                    entry.parent = parent;
                    entry.name = name.to_string();
                    drop(occupied);
                    self.children.remove_if(&stale, |_, v| *v == ino);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(NodeEntry::new(parent, name.to_string(), 1));
            }
        }
        if let Some(previous) = self.children.insert(key, ino)
            && previous != ino
        {
            self.detach(previous);
        }
        trace!(ino, parent, name, "Node linked");
        ino
    }

    /// Unlinks whatever node sits at `(parent, name)`.
    ///
    /// The node entry itself stays until the kernel forgets it; its path no
    /// longer resolves.
    pub fn remove_child(&self, parent: u64, name: &str) {
        if let Some((_, ino)) = self.children.remove(&(parent, name.to_string())) {
            self.detach(ino);
        }
    }

    fn detach(&self, ino: u64) {
        if let Some(mut entry) = self.nodes.get_mut(&ino) {
            entry.parent = DETACHED;
        }
    }

    /// Moves the node at `(parent, name)` to `(new_parent, new_name)`.
    pub fn rename(&self, parent: u64, name: &str, new_parent: u64, new_name: &str) {
        let Some((_, ino)) = self.children.remove(&(parent, name.to_string())) else {
            // Never looked up; nothing to move. Still unlink any replaced target.
            self.remove_child(new_parent, new_name);
            return;
        };
        if let Some(previous) = self.children.insert((new_parent, new_name.to_string()), ino)
            && previous != ino
        {
            self.detach(previous);
        }
        if let Some(mut entry) = self.nodes.get_mut(&ino) {
            entry.parent = new_parent;
            entry.name = new_name.to_string();
        }
    }

    /// Drops `count` kernel references to `ino`, evicting it at zero.
    ///
    /// Returns true if the node was evicted. The root is never evicted.
    pub fn forget(&self, ino: u64, count: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let remaining = match self.nodes.get(&ino) {
            Some(entry) => entry.dec_nlookup(count),
            None => return false,
        };
        if remaining > 0 {
            return false;
        }
        let Some((_, entry)) = self.nodes.remove_if(&ino, |_, e| e.nlookup() == 0) else {
            return false;
        };
        if entry.parent != DETACHED {
            self.children
                .remove_if(&(entry.parent, entry.name), |_, v| *v == ino);
        }
        trace!(ino, "Node evicted");
        true
    }

    /// Number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
