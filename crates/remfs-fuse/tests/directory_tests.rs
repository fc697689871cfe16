//! Directory streams and namespace changes.

mod common;

use common::*;
use remfs_client::{Capability, RemoteClient};
use remfs_fuse::{DirStream, Errno, ROOT_INODE};
use std::sync::Arc;

/// `RENAME_NOREPLACE` as passed by the kernel.
const RENAME_NOREPLACE: u32 = 1;

#[tokio::test]
async fn empty_directory_has_nothing_next() {
    let fs = TestFs::new().await;
    fs.seed_dir("/empty").await;
    let dir = fs.lookup(ROOT_INODE, "empty").await;
    fs.remote.clear_calls();

    let fh = fs.ops.opendir(dir.ino).await.unwrap();
    let stream = Arc::clone(&fs.ops.dir(fh).unwrap().state.lock().stream);
    assert!(!stream.has_next().await);
    assert!(stream.next().await.unwrap().is_none());

    assert_eq!(fs.remote.calls_for(Capability::Stat), ["/empty"]);
    assert_eq!(fs.remote.calls_for(Capability::ListDir), ["/empty"]);
}

#[tokio::test]
async fn single_entry_is_also_the_last() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    fs.seed_file("/d/only", b"").await;
    let dir = fs.lookup(ROOT_INODE, "d").await;

    let fh = fs.ops.opendir(dir.ino).await.unwrap();
    let stream = Arc::clone(&fs.ops.dir(fh).unwrap().state.lock().stream);
    assert!(stream.has_next().await);
    let (entry, _) = stream.next().await.unwrap().unwrap();
    assert_eq!(entry.name, "only");
    assert!(!stream.has_next().await);
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test]
async fn many_entries_are_each_yielded_once() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    let mut expected = Vec::new();
    for i in 0..40 {
        let name = format!("file-{i:03}");
        fs.seed_file(&format!("/d/{name}"), b"").await;
        expected.push(name);
    }
    fs.seed_dir("/d/sub").await;
    fs.seed_file("/d/sub/nested", b"").await;
    expected.push("sub".to_string());

    let dir = fs.lookup(ROOT_INODE, "d").await;
    assert_eq!(fs.list(dir.ino).await, expected);
}

#[tokio::test]
async fn entries_carry_remote_ids() {
    let fs = TestFs::new().await;
    fs.seed_file("/a", b"abc").await;
    let fh = fs.ops.opendir(ROOT_INODE).await.unwrap();
    let stream = Arc::clone(&fs.ops.dir(fh).unwrap().state.lock().stream);

    let (entry, _) = stream.next().await.unwrap().unwrap();
    let node = fs.lookup(ROOT_INODE, "a").await;
    assert_eq!(fs.ops.tree().kernel_ino(entry.id), node.ino);
    assert_eq!(entry.stat.size, 3);
}

#[tokio::test]
async fn opendir_on_missing_path_fails() {
    let fs = TestFs::new().await;
    fs.seed_dir("/gone").await;
    let dir = fs.lookup(ROOT_INODE, "gone").await;
    fs.remote.rmdir("/gone").await.unwrap();

    assert_eq!(fs.ops.opendir(dir.ino).await.unwrap_err(), Errno::ENOENT);
    assert!(fs.ops.handles().is_empty());
}

#[tokio::test]
async fn opendir_on_file_fails() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let node = fs.lookup(ROOT_INODE, "f").await;
    assert_eq!(fs.ops.opendir(node.ino).await.unwrap_err(), Errno::ENOTDIR);
}

#[tokio::test]
async fn releasedir_is_single_use() {
    let fs = TestFs::new().await;
    let fh = fs.ops.opendir(ROOT_INODE).await.unwrap();
    fs.ops.releasedir(fh).unwrap();
    assert_eq!(fs.ops.releasedir(fh).unwrap_err(), Errno::EBADF);
}

#[tokio::test]
async fn listing_error_leaves_stream_usable() {
    let fs = TestFs::new().await;
    fs.seed_file("/a", b"").await;
    fs.seed_file("/b", b"").await;
    let fh = fs.ops.opendir(ROOT_INODE).await.unwrap();
    let stream = Arc::clone(&fs.ops.dir(fh).unwrap().state.lock().stream);

    fs.remote.fail_next(Capability::ListDir, libc::EIO);
    assert_eq!(stream.next().await.unwrap_err(), Errno::EIO);

    let mut names = Vec::new();
    while let Some((entry, _)) = stream.next().await.unwrap() {
        names.push(entry.name);
    }
    assert_eq!(names, ["a", "b"]);
}

#[tokio::test]
async fn unlink_and_rmdir_detach_nodes() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    fs.seed_file("/f", b"").await;
    let dir = fs.lookup(ROOT_INODE, "d").await;
    let file = fs.lookup(ROOT_INODE, "f").await;

    fs.ops.unlink(ROOT_INODE, "f").await.unwrap();
    fs.ops.rmdir(ROOT_INODE, "d").await.unwrap();

    assert!(!fs.remote.contains("/f"));
    assert!(!fs.remote.contains("/d"));
    assert!(fs.ops.tree().path(file.ino).is_none());
    assert!(fs.ops.tree().path(dir.ino).is_none());
    assert_eq!(fs.ops.getattr(file.ino).await.unwrap_err(), Errno::ENOENT);
}

#[tokio::test]
async fn remote_errors_pass_through() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    fs.seed_file("/d/f", b"").await;

    assert_eq!(
        fs.ops.rmdir(ROOT_INODE, "d").await.unwrap_err(),
        Errno(libc::ENOTEMPTY)
    );
    assert_eq!(
        fs.ops.unlink(ROOT_INODE, "d").await.unwrap_err(),
        Errno::EISDIR
    );
    assert_eq!(
        fs.ops.unlink(ROOT_INODE, "missing").await.unwrap_err(),
        Errno::ENOENT
    );
    assert!(fs.remote.contains("/d/f"));
}

#[tokio::test]
async fn rename_flags_are_rejected() {
    let fs = TestFs::new().await;
    fs.seed_file("/a", b"").await;
    fs.remote.clear_calls();

    let err = fs
        .ops
        .rename(ROOT_INODE, "a", ROOT_INODE, "b", RENAME_NOREPLACE)
        .await
        .unwrap_err();
    assert_eq!(err, Errno::EINVAL);
    assert!(fs.remote.calls_for(Capability::Rename).is_empty());
    assert!(fs.remote.contains("/a"));
}

#[tokio::test]
async fn rename_replaces_target() {
    let fs = TestFs::new().await;
    fs.seed_file("/a", b"new").await;
    fs.seed_file("/b", b"old").await;
    let a = fs.lookup(ROOT_INODE, "a").await;
    let b = fs.lookup(ROOT_INODE, "b").await;

    fs.ops.rename(ROOT_INODE, "a", ROOT_INODE, "b", 0).await.unwrap();

    assert_eq!(fs.remote.contents("/b").unwrap(), b"new");
    assert_eq!(fs.ops.tree().child(ROOT_INODE, "b"), Some(a.ino));
    assert!(fs.ops.tree().path(b.ino).is_none());
}

async fn drain(stream: Arc<DirStream>) -> Vec<String> {
    let mut names = Vec::new();
    while let Some((entry, _)) = stream.next().await.expect("next") {
        names.push(entry.name);
    }
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_next_calls_share_one_cursor() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    let mut expected = Vec::new();
    for i in 0..50 {
        let name = format!("f{i:02}");
        fs.seed_file(&format!("/d/{name}"), b"").await;
        expected.push(name);
    }

    let stream = Arc::new(fs.ops.open_stream("/d".to_string()).await.unwrap());
    let (a, b) = tokio::join!(
        tokio::spawn(drain(Arc::clone(&stream))),
        tokio::spawn(drain(Arc::clone(&stream))),
    );

    let mut seen = a.unwrap();
    seen.extend(b.unwrap());
    seen.sort();
    assert_eq!(seen, expected);
    assert!(!stream.has_next().await);
    assert!(stream.next().await.unwrap().is_none());
}
