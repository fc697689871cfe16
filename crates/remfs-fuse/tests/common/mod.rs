//! Shared harness for orchestrator integration tests.
//!
//! Every test runs [`RemoteOps`] against an in-process [`MemoryRemote`], so
//! the remote call log and fault injection are available for assertions.

// Not all tests use every helper
#![allow(dead_code)]

use remfs_client::{MemoryRemote, RemoteClient, Stat};
use remfs_fuse::{Caller, MountConfig, NodeInfo, ROOT_INODE, RemoteOps};
use std::sync::Arc;

/// Uid/gid the memory backend assigns to new objects.
pub const SERVICE_OWNER: (u32, u32) = (500, 500);

/// The user issuing kernel requests in tests.
pub const CALLER: Caller = Caller {
    uid: 1000,
    gid: 1000,
};

/// An orchestrator wired to a fresh memory backend.
pub struct TestFs {
    pub remote: Arc<MemoryRemote>,
    pub ops: RemoteOps,
}

impl TestFs {
    /// Unprivileged mount of `/`.
    pub async fn new() -> Self {
        Self::with_config(MountConfig::default().privileged(false)).await
    }

    /// Mount as if running as root.
    pub async fn privileged() -> Self {
        Self::with_config(MountConfig::default().privileged(true)).await
    }

    pub async fn with_config(config: MountConfig) -> Self {
        let remote = Arc::new(MemoryRemote::new().owner(SERVICE_OWNER.0, SERVICE_OWNER.1));
        Self::on(remote, config).await
    }

    /// Mounts an already populated backend.
    pub async fn on(remote: Arc<MemoryRemote>, config: MountConfig) -> Self {
        let ops = RemoteOps::connect(remote.clone(), &config)
            .await
            .expect("connect to memory backend");
        Self { remote, ops }
    }

    pub async fn stat(&self, path: &str) -> Stat {
        self.remote.get_attr(path).await.expect("stat")
    }

    /// Creates a regular file directly on the backend.
    pub async fn seed_file(&self, path: &str, data: &[u8]) {
        self.remote.mknod(path, 0o644, 0).await.expect("mknod");
        if !data.is_empty() {
            let fd = self.remote.open(path, libc::O_WRONLY).await.expect("open");
            self.remote.write(fd, data, 0).await.expect("write");
            self.remote.release(fd).await.expect("release");
        }
    }

    pub async fn seed_dir(&self, path: &str) {
        self.remote.mkdir(path, 0o755).await.expect("mkdir");
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> NodeInfo {
        self.ops.lookup(parent, name).await.expect("lookup")
    }

    /// Looks up every component of `path` from the root.
    pub async fn resolve(&self, path: &str) -> NodeInfo {
        let mut node = None;
        let mut parent = ROOT_INODE;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            let info = self.lookup(parent, name).await;
            parent = info.ino;
            node = Some(info);
        }
        node.expect("path below the root")
    }

    /// Opens `ino` as a directory and collects every entry name.
    pub async fn list(&self, ino: u64) -> Vec<String> {
        let fh = self.ops.opendir(ino).await.expect("opendir");
        let stream = Arc::clone(&self.ops.dir(fh).expect("dir handle").state.lock().stream);
        let mut names = Vec::new();
        while let Some((entry, _)) = stream.next().await.expect("next") {
            names.push(entry.name);
        }
        self.ops.releasedir(fh).expect("releasedir");
        names
    }
}
