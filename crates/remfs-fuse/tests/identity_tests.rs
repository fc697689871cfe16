//! Inode identity: kernel inode numbers come from remote ids and stay stable.

mod common;

use common::*;
use fuser::FileType;
use remfs_client::{Capability, MemoryRemote, RemoteClient};
use remfs_fuse::{Errno, MountConfig, ROOT_INODE};
use std::sync::Arc;

#[tokio::test]
async fn root_is_inode_one() {
    let fs = TestFs::new().await;
    let attr = fs.ops.getattr(ROOT_INODE).await.unwrap();
    assert_eq!(attr.ino, ROOT_INODE);
    assert_eq!(attr.kind, FileType::Directory);
    assert_eq!(attr.nlink, 2);
}

#[tokio::test]
async fn lookup_uses_remote_id() {
    let fs = TestFs::new().await;
    fs.seed_file("/a", b"hello").await;
    let dev = fs.stat("/a").await.dev;

    let node = fs.lookup(ROOT_INODE, "a").await;
    assert_eq!(node.ino, dev);
    assert_eq!(node.attr.ino, dev);
    assert_eq!(node.stable.ino, dev);
    assert_eq!(node.stable.generation, 1);
    assert_eq!(node.attr.size, 5);
    assert_eq!(node.attr.kind, FileType::RegularFile);
}

#[tokio::test]
async fn repeated_lookups_agree() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    fs.seed_file("/d/f", b"").await;

    let first = fs.resolve("/d/f").await;
    let second = fs.resolve("/d/f").await;
    assert_eq!(first.ino, second.ino);
    assert_eq!(fs.ops.tree().nlookup(first.ino), Some(2));
    assert_eq!(fs.ops.getattr(first.ino).await.unwrap().ino, first.ino);
}

#[tokio::test]
async fn identity_survives_rename() {
    let fs = TestFs::new().await;
    fs.seed_dir("/src").await;
    fs.seed_dir("/dst").await;
    fs.seed_file("/src/f", b"x").await;

    let src = fs.lookup(ROOT_INODE, "src").await;
    let dst = fs.lookup(ROOT_INODE, "dst").await;
    let file = fs.lookup(src.ino, "f").await;

    fs.ops.rename(src.ino, "f", dst.ino, "g", 0).await.unwrap();
    assert_eq!(fs.ops.tree().path(file.ino).as_deref(), Some("/dst/g"));

    let moved = fs.lookup(dst.ino, "g").await;
    assert_eq!(moved.ino, file.ino);
    assert_eq!(
        fs.ops.lookup(src.ino, "f").await.unwrap_err(),
        Errno::ENOENT
    );
}

#[tokio::test]
async fn forget_evicts_at_zero() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let node = fs.lookup(ROOT_INODE, "f").await;
    fs.lookup(ROOT_INODE, "f").await;

    fs.ops.forget(node.ino, 1);
    assert!(fs.ops.tree().contains(node.ino));
    fs.ops.forget(node.ino, 1);
    assert!(!fs.ops.tree().contains(node.ino));

    // Forgetting the root is ignored.
    fs.ops.forget(ROOT_INODE, 10);
    assert!(fs.ops.getattr(ROOT_INODE).await.is_ok());
}

#[tokio::test]
async fn unknown_inode_is_enoent() {
    let fs = TestFs::new().await;
    assert_eq!(fs.ops.getattr(424_242).await.unwrap_err(), Errno::ENOENT);
    assert_eq!(
        fs.ops.lookup(424_242, "x").await.unwrap_err(),
        Errno::ENOENT
    );
}

#[tokio::test]
async fn subdirectory_root_maps_to_inode_one() {
    let remote = Arc::new(MemoryRemote::new());
    remote.mkdir("/export", 0o755).await.unwrap();
    remote.mknod("/export/f", 0o644, 0).await.unwrap();
    remote.mknod("/outside", 0o644, 0).await.unwrap();

    let fs = TestFs::on(remote, MountConfig::default().remote_root("export/")).await;
    assert_eq!(fs.ops.tree().remote_root(), "/export");
    let node = fs.lookup(ROOT_INODE, "f").await;
    assert_eq!(fs.ops.tree().path(node.ino).as_deref(), Some("/export/f"));
    assert_eq!(
        fs.ops.lookup(ROOT_INODE, "outside").await.unwrap_err(),
        Errno::ENOENT
    );
}

#[tokio::test]
async fn root_must_be_a_directory() {
    let remote = Arc::new(MemoryRemote::new());
    remote.mknod("/file", 0o644, 0).await.unwrap();
    let err = remfs_fuse::RemoteOps::connect(remote, &MountConfig::default().remote_root("/file"))
        .await
        .unwrap_err();
    assert!(matches!(err, remfs_fuse::FsError::RemoteRoot(_)));
}

#[tokio::test]
async fn volume_info_failure_is_fatal() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(Capability::GetVolumeInfo, libc::EACCES);
    let err = remfs_fuse::RemoteOps::connect(remote, &MountConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, remfs_fuse::FsError::VolumeInfo(_)));
}
