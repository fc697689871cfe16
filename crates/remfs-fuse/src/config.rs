//! Mount configuration for the FUSE filesystem.

use std::time::Duration;

/// Default kernel entry/attribute cache timeout.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Default timeout for a single bridged remote operation.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default filesystem name shown in the mount table.
pub const DEFAULT_FSNAME: &str = "remfs";

/// Returns true when the process runs with an effective uid of 0.
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Configuration options for the FUSE filesystem.
///
/// There is no attribute cache in the adapter itself; `entry_ttl` and
/// `attr_ttl` only tell the kernel how long it may keep what it was given.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Remote directory that appears as the mount root.
    pub remote_root: String,

    /// Kernel cache timeout for name lookups.
    pub entry_ttl: Duration,

    /// Kernel cache timeout for attributes.
    pub attr_ttl: Duration,

    /// Timeout for individual remote operations.
    ///
    /// Operations that exceed it fail with ETIMEDOUT.
    pub io_timeout: Duration,

    /// Hand new objects to the calling user (requires root).
    ///
    /// Default: whether the process runs as root.
    pub privileged: bool,

    pub allow_other: bool,
    pub default_permissions: bool,
    pub read_only: bool,

    /// Source name shown in the mount table.
    pub fsname: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            remote_root: "/".to_string(),
            entry_ttl: DEFAULT_TTL,
            attr_ttl: DEFAULT_TTL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            privileged: running_as_root(),
            allow_other: true,
            default_permissions: true,
            read_only: false,
            fsname: DEFAULT_FSNAME.to_string(),
        }
    }
}

impl MountConfig {
    #[must_use]
    pub fn remote_root(mut self, root: impl Into<String>) -> Self {
        self.remote_root = root.into();
        self
    }

    /// Sets both kernel cache timeouts.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the I/O timeout for individual operations.
    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow: bool) -> Self {
        self.allow_other = allow;
        self
    }

    #[must_use]
    pub fn default_permissions(mut self, enabled: bool) -> Self {
        self.default_permissions = enabled;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn fsname(mut self, name: impl Into<String>) -> Self {
        self.fsname = name.into();
        self
    }
}
