//! Open file handles, extended attributes and filesystem statistics.

mod common;

use common::*;
use remfs_client::{Capability, RemoteClient};
use remfs_fuse::ops::MAX_COPY_LEN;
use remfs_fuse::{Errno, ROOT_INODE};

async fn open(fs: &TestFs, name: &str, flags: i32) -> u64 {
    let node = fs.lookup(ROOT_INODE, name).await;
    fs.ops.open(node.ino, flags).await.expect("open")
}

#[tokio::test]
async fn write_then_read_back() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let fh = open(&fs, "f", libc::O_RDWR).await;

    assert_eq!(fs.ops.write(fh, 0, b"hello world").await.unwrap(), 11);
    assert_eq!(fs.ops.write(fh, 6, b"there").await.unwrap(), 5);
    assert_eq!(fs.ops.read(fh, 0, 64).await.unwrap(), b"hello there");
    assert_eq!(fs.ops.read(fh, 6, 3).await.unwrap(), b"the");
    assert!(fs.ops.read(fh, 100, 8).await.unwrap().is_empty());

    fs.ops.flush(fh).await.unwrap();
    fs.ops.fsync(fh).await.unwrap();
    fs.ops.release(fh).await.unwrap();
    assert_eq!(fs.remote.open_descriptors(), 0);
}

#[tokio::test]
async fn open_strips_append() {
    let fs = TestFs::new().await;
    fs.seed_file("/log", b"abc").await;
    let fh = open(&fs, "log", libc::O_WRONLY | libc::O_APPEND).await;

    let flags = fs.remote.last_open_flags().unwrap();
    assert_eq!(flags & libc::O_APPEND, 0);

    // Writes land at the offset the kernel supplies.
    fs.ops.write(fh, 3, b"def").await.unwrap();
    assert_eq!(fs.remote.contents("/log").unwrap(), b"abcdef");
}

#[tokio::test]
async fn handle_calls_use_path_from_open() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"x").await;
    let fh = open(&fs, "f", libc::O_RDWR).await;
    fs.remote.clear_calls();

    fs.ops.flush(fh).await.unwrap();
    fs.ops.fsync(fh).await.unwrap();
    let node = fs.lookup(ROOT_INODE, "f").await;
    let attr = fs.ops.getattr_handle(node.ino, fh).await.unwrap();

    assert_eq!(attr.size, 1);
    assert_eq!(fs.remote.calls_for(Capability::Flush), ["/f"]);
    assert_eq!(fs.remote.calls_for(Capability::Fsync), ["/f"]);
}

#[tokio::test]
async fn double_release_is_bad_descriptor() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let fh = open(&fs, "f", libc::O_RDONLY).await;
    fs.remote.clear_calls();

    fs.ops.release(fh).await.unwrap();
    assert_eq!(fs.ops.release(fh).await.unwrap_err(), Errno::EBADF);
    assert_eq!(fs.remote.calls_for(Capability::Release).len(), 1);
}

#[tokio::test]
async fn failed_release_still_retires_handle() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let fh = open(&fs, "f", libc::O_RDONLY).await;
    fs.remote.fail_next(Capability::Release, libc::EIO);

    assert_eq!(fs.ops.release(fh).await.unwrap_err(), Errno::EIO);
    assert_eq!(fs.ops.release(fh).await.unwrap_err(), Errno::EBADF);
    assert!(fs.ops.handles().is_empty());
}

#[tokio::test]
async fn released_handle_rejects_io() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"abc").await;
    let fh = open(&fs, "f", libc::O_RDWR).await;
    fs.ops.release(fh).await.unwrap();

    assert_eq!(fs.ops.read(fh, 0, 3).await.unwrap_err(), Errno::EBADF);
    assert_eq!(fs.ops.write(fh, 0, b"z").await.unwrap_err(), Errno::EBADF);
    assert_eq!(fs.ops.flush(fh).await.unwrap_err(), Errno::EBADF);
}

#[tokio::test]
async fn directory_handle_is_not_a_file() {
    let fs = TestFs::new().await;
    let fh = fs.ops.opendir(ROOT_INODE).await.unwrap();
    assert_eq!(fs.ops.read(fh, 0, 1).await.unwrap_err(), Errno::EISDIR);
    assert_eq!(fs.ops.release(fh).await.unwrap_err(), Errno::EISDIR);
    fs.ops.releasedir(fh).unwrap();
}

#[tokio::test]
async fn write_on_read_only_descriptor_fails() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let fh = open(&fs, "f", libc::O_RDONLY).await;
    assert_eq!(fs.ops.write(fh, 0, b"x").await.unwrap_err(), Errno::EBADF);
}

#[tokio::test]
async fn open_directory_fails() {
    let fs = TestFs::new().await;
    fs.seed_dir("/d").await;
    let node = fs.lookup(ROOT_INODE, "d").await;
    assert_eq!(
        fs.ops.open(node.ino, libc::O_RDONLY).await.unwrap_err(),
        Errno::EISDIR
    );
}

#[tokio::test]
async fn copy_file_range_between_own_handles() {
    let fs = TestFs::new().await;
    fs.seed_file("/src", b"0123456789").await;
    fs.seed_file("/dst", b"").await;
    let src = open(&fs, "src", libc::O_RDONLY).await;
    let dst = open(&fs, "dst", libc::O_WRONLY).await;

    let copied = fs.ops.copy_file_range(src, 2, dst, 0, 5).await.unwrap();
    assert_eq!(copied, 5);
    assert_eq!(fs.remote.contents("/dst").unwrap(), b"23456");
    assert_eq!(fs.remote.calls_for(Capability::CopyExtent), ["/src"]);
}

#[tokio::test]
async fn copy_file_range_request_fits_the_reply() {
    let fs = TestFs::new().await;
    fs.seed_file("/src", b"abc").await;
    fs.seed_file("/dst", b"").await;
    let src = open(&fs, "src", libc::O_RDONLY).await;
    let dst = open(&fs, "dst", libc::O_WRONLY).await;

    let copied = fs.ops.copy_file_range(src, 0, dst, 0, u64::MAX).await.unwrap();
    assert_eq!(copied, 3);
    assert_eq!(fs.remote.last_copy_len(), Some(MAX_COPY_LEN));
    assert_eq!(MAX_COPY_LEN, u64::from(u32::MAX));
}

#[tokio::test]
async fn copy_file_range_rejects_foreign_handles() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"abc").await;
    let file = open(&fs, "f", libc::O_RDWR).await;
    let dir = fs.ops.opendir(ROOT_INODE).await.unwrap();
    fs.remote.clear_calls();

    assert_eq!(
        fs.ops.copy_file_range(dir, 0, file, 0, 3).await.unwrap_err(),
        Errno::ENOTSUP
    );
    assert_eq!(
        fs.ops.copy_file_range(file, 0, dir, 0, 3).await.unwrap_err(),
        Errno::ENOTSUP
    );
    assert_eq!(
        fs.ops.copy_file_range(file, 0, 9999, 0, 3).await.unwrap_err(),
        Errno::EBADF
    );
    assert!(fs.remote.calls_for(Capability::CopyExtent).is_empty());
}

#[tokio::test]
async fn xattr_lifecycle() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let node = fs.lookup(ROOT_INODE, "f").await;

    assert_eq!(fs.ops.listxattr(node.ino).await.unwrap(), b"");
    fs.ops.setxattr(node.ino, "user.a", b"1").await.unwrap();
    fs.ops.setxattr(node.ino, "user.bb", b"two").await.unwrap();

    assert_eq!(fs.ops.getxattr(node.ino, "user.bb").await.unwrap(), b"two");
    assert_eq!(
        fs.ops.listxattr(node.ino).await.unwrap(),
        b"user.a\0user.bb\0"
    );

    fs.ops.removexattr(node.ino, "user.a").await.unwrap();
    assert_eq!(fs.ops.listxattr(node.ino).await.unwrap(), b"user.bb\0");
    assert_eq!(
        fs.ops.getxattr(node.ino, "user.a").await.unwrap_err(),
        Errno(libc::ENODATA)
    );
    assert_eq!(
        fs.ops.removexattr(node.ino, "user.a").await.unwrap_err(),
        Errno(libc::ENODATA)
    );
}

#[tokio::test]
async fn listxattr_reads_the_stat_record() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    fs.remote.set_xattr("/f", "user.k", "v").await.unwrap();
    let node = fs.lookup(ROOT_INODE, "f").await;
    fs.remote.clear_calls();

    fs.ops.listxattr(node.ino).await.unwrap();
    assert_eq!(fs.remote.calls_for(Capability::Stat), ["/f"]);
    assert!(fs.remote.calls_for(Capability::GetXAttr).is_empty());
}

#[tokio::test]
async fn non_utf8_xattr_value_is_invalid() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let node = fs.lookup(ROOT_INODE, "f").await;
    fs.remote.clear_calls();

    assert_eq!(
        fs.ops
            .setxattr(node.ino, "user.bin", &[0xff, 0xfe])
            .await
            .unwrap_err(),
        Errno::EINVAL
    );
    assert!(fs.remote.calls_for(Capability::SetXAttr).is_empty());
}

#[tokio::test]
async fn statfs_reports_backend_numbers() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", &[0u8; 10_000]).await;
    let st = fs.ops.statfs().await.unwrap();
    assert_eq!(st.bsize, 4096);
    assert_eq!(st.namelen, 255);
    assert!(st.bfree < st.blocks);
}

#[tokio::test]
async fn readlink_on_regular_file_fails() {
    let fs = TestFs::new().await;
    fs.seed_file("/f", b"").await;
    let node = fs.lookup(ROOT_INODE, "f").await;
    assert!(fs.ops.readlink(node.ino).await.is_err());
}
