//! Error translation for the filesystem adapter.
//!
//! Every remote failure reaches the kernel as an [`Errno`]. The
//! `From<RemoteError>` impl is the only place a remote error becomes a POSIX
//! code, so `?` inside the orchestrator always yields a translated error.

use crate::bridge::BridgeError;
use remfs_client::RemoteError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A POSIX error code handed back to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("errno {0}")]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const ERANGE: Errno = Errno(libc::ERANGE);
    pub const EROFS: Errno = Errno(libc::EROFS);
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);

    /// Returns the raw code.
    #[inline]
    pub fn code(self) -> i32 {
        self.0
    }
}

impl From<RemoteError> for Errno {
    fn from(e: RemoteError) -> Self {
        Errno(translate(Some(&e)))
    }
}

impl From<BridgeError> for Errno {
    fn from(e: BridgeError) -> Self {
        Errno(e.to_errno())
    }
}

/// Maps an optional remote error to a POSIX code.
///
/// `None` is success (0). A structured backend code passes through verbatim.
/// Anything else, including non-positive codes, becomes `ENOTSUP`.
pub fn translate(err: Option<&RemoteError>) -> i32 {
    match err {
        None => 0,
        Some(RemoteError::Status { code, .. }) if *code > 0 => *code,
        Some(_) => libc::ENOTSUP,
    }
}

/// Result type for adapter operations.
pub type FsResult<T> = Result<T, Errno>;

/// Errors raised while building or mounting the filesystem.
#[derive(Debug, Error)]
pub enum FsError {
    /// Volume metadata could not be fetched at mount time.
    #[error("Failed to fetch volume info: {0}")]
    VolumeInfo(#[source] RemoteError),

    /// The remote root path does not exist or is not a directory.
    #[error("Remote root is not a directory: {0}")]
    RemoteRoot(String),

    /// Tokio runtime could not be created.
    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),

    /// Mountpoint is missing or not a directory.
    #[error("Invalid mountpoint: {}", .0.display())]
    InvalidMountpoint(PathBuf),

    /// The FUSE session failed to start.
    #[error("Mount failed: {0}")]
    Mount(#[from] io::Error),

    /// The FUSE session did not come up in time.
    #[error("Mount timed out after {0:?}")]
    MountTimeout(Duration),

    /// A setup call could not be run on the runtime.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for RemoteError {
    fn to_errno(&self) -> i32 {
        translate(Some(self))
    }
}

impl ToErrno for Errno {
    fn to_errno(&self) -> i32 {
        self.0
    }
}

impl ToErrno for FsError {
    fn to_errno(&self) -> i32 {
        match self {
            FsError::VolumeInfo(e) => e.to_errno(),
            FsError::RemoteRoot(_) => libc::ENOTDIR,
            FsError::Runtime(e) | FsError::Mount(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::InvalidMountpoint(_) => libc::ENOENT,
            FsError::MountTimeout(_) => libc::ETIMEDOUT,
            FsError::Bridge(e) => e.to_errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_success() {
        assert_eq!(translate(None), 0);
    }

    #[test]
    fn status_codes_pass_through() {
        for code in [libc::ENOENT, libc::EACCES, libc::EEXIST, libc::ENOSPC, libc::EDQUOT] {
            let e = RemoteError::status(code, "x");
            assert_eq!(translate(Some(&e)), code);
            assert_eq!(Errno::from(e), Errno(code));
        }
    }

    #[test]
    fn unrecognized_shapes_are_not_supported() {
        let cases = [
            RemoteError::Transport("reset".into()),
            RemoteError::Io(io::Error::from_raw_os_error(libc::EPERM)),
            RemoteError::UnsupportedScheme("ftp".into()),
            RemoteError::InvalidUrl("::".into()),
            RemoteError::status(0, "zero"),
            RemoteError::status(-5, "negative"),
        ];
        for e in &cases {
            assert_eq!(translate(Some(e)), libc::ENOTSUP, "{e}");
        }
    }

    #[test]
    fn bridge_errors_map() {
        assert_eq!(
            Errno::from(BridgeError::Timeout(Duration::from_secs(1))),
            Errno(libc::ETIMEDOUT)
        );
        assert_eq!(Errno::from(BridgeError::Cancelled), Errno(libc::ECANCELED));
    }

    #[test]
    fn fs_error_errno() {
        let e = FsError::VolumeInfo(RemoteError::status(libc::EACCES, "denied"));
        assert_eq!(e.to_errno(), libc::EACCES);
        assert!(e.to_string().contains("volume info"));

        let e = FsError::InvalidMountpoint(PathBuf::from("/nope"));
        assert_eq!(e.to_errno(), libc::ENOENT);
        assert!(e.to_string().contains("/nope"));

        assert_eq!(
            FsError::Mount(io::Error::other("x")).to_errno(),
            libc::EIO
        );
    }
}
