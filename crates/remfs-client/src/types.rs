//! Records exchanged with the remote service.
//!
//! These mirror what the service returns on the wire after decoding. Times
//! are integer epoch milliseconds; `blksize` and `blocks` are whatever the
//! service reports and are never handed to the kernel verbatim.

/// File type bits of a mode word.
pub const S_IFMT: u32 = 0o170000;
/// Directory file type.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type.
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link file type.
pub const S_IFLNK: u32 = 0o120000;

/// One extended attribute of a remote object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XAttr {
    pub key: String,
    pub value: String,
}

impl XAttr {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Metadata of a remote object as returned by `Stat`/`GetAttr`/`ListDir`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Entry name (the last path segment).
    pub file_name: String,
    /// Full mode word including file type bits.
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    /// Per-object device/serial identifier. Never reused by the service.
    pub dev: u64,
    /// Block size as reported by the service.
    pub blksize: u64,
    /// Block count as reported by the service.
    pub blocks: u64,
    /// Access time, epoch milliseconds.
    pub atime: i64,
    /// Modification time, epoch milliseconds.
    pub mtime: i64,
    /// Status change time, epoch milliseconds.
    pub ctime: i64,
    /// Extended attributes in service order.
    pub xattrs: Vec<XAttr>,
}

impl Stat {
    /// Returns the file type bits.
    #[inline]
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    /// Looks up an extended attribute by key.
    pub fn xattr(&self, key: &str) -> Option<&str> {
        self.xattrs
            .iter()
            .find(|x| x.key == key)
            .map(|x| x.value.as_str())
    }
}

/// One page of a directory listing.
///
/// `marker` is an opaque continuation token; passing it back to `ListDir`
/// resumes the listing after the last returned entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirPage {
    pub marker: String,
    pub entries: Vec<Stat>,
}

/// Filesystem-wide capacity as reported by `StatFS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// Volume metadata as reported by `GetVolumeInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Serial number, also the device id of the volume root.
    pub serial_number: u64,
    pub name: String,
    pub capacity: u64,
    pub current_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_helpers() {
        let dir = Stat {
            mode: S_IFDIR | 0o755,
            ..Default::default()
        };
        assert!(dir.is_dir());
        assert!(!dir.is_symlink());

        let link = Stat {
            mode: S_IFLNK | 0o777,
            ..Default::default()
        };
        assert!(link.is_symlink());
        assert_eq!(link.file_type(), S_IFLNK);
    }

    #[test]
    fn xattr_lookup_keeps_first_match() {
        let stat = Stat {
            xattrs: vec![XAttr::new("user.a", "1"), XAttr::new("user.b", "2")],
            ..Default::default()
        };
        assert_eq!(stat.xattr("user.b"), Some("2"));
        assert_eq!(stat.xattr("user.c"), None);
    }
}
