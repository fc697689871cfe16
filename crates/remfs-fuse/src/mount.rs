//! Mounting a [`RemoteFs`] at a local directory.

use crate::config::MountConfig;
use crate::error::FsError;
use crate::filesystem::RemoteFs;
use fuser::{BackgroundSession, MountOption};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for the kernel to accept the mount.
pub const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful unmount may take before falling back to the OS tools.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Filesystem subtype shown in the mount table (`fuse.remfs`).
const SUBTYPE: &str = "remfs";

/// Builds the fuser mount options for `config`.
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fsname.clone()),
        MountOption::Subtype(SUBTYPE.to_string()),
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    options.push(if config.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if config.default_permissions {
        options.push(MountOption::DefaultPermissions);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
        // AutoUnmount is only accepted together with allow_other/allow_root.
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Checks that `mountpoint` is an existing directory.
pub fn validate_mountpoint(mountpoint: &Path) -> Result<(), FsError> {
    if mountpoint.is_dir() {
        Ok(())
    } else {
        Err(FsError::InvalidMountpoint(mountpoint.to_path_buf()))
    }
}

/// A live mount. Dropping it unmounts.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("mounted", &self.session.is_some())
            .finish()
    }
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the session thread to finish.
    pub fn unmount(mut self) {
        info!(mountpoint = %self.mountpoint.display(), "Unmounting");
        if let Some(session) = self.session.take() {
            session.join();
        }
        info!(mountpoint = %self.mountpoint.display(), "Unmounted");
    }

    /// Detaches the mount with the platform's unmount tool.
    fn force_unmount(&self) {
        #[cfg(target_os = "macos")]
        let result = std::process::Command::new("umount")
            .arg("-f")
            .arg(&self.mountpoint)
            .output();

        #[cfg(not(target_os = "macos"))]
        let result = std::process::Command::new("fusermount")
            .arg("-uz")
            .arg(&self.mountpoint)
            .output();

        match result {
            Ok(output) if output.status.success() => debug!("Forced unmount succeeded"),
            Ok(output) => warn!(status = %output.status, "Forced unmount failed"),
            Err(e) => warn!(error = %e, "Could not run unmount tool"),
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        debug!(mountpoint = %self.mountpoint.display(), "Unmounting on drop");
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });
        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            warn!(
                timeout = ?JOIN_TIMEOUT,
                mountpoint = %self.mountpoint.display(),
                "Session did not stop, forcing unmount"
            );
            self.force_unmount();
        }
    }
}

/// Mounts `fs` at `mountpoint` in a background session.
///
/// The mount call runs on its own thread so that a stale mount at the same
/// path cannot block the caller forever.
pub fn mount(fs: RemoteFs, mountpoint: &Path) -> Result<MountHandle, FsError> {
    validate_mountpoint(mountpoint)?;
    let options = mount_options(fs.config());
    info!(
        mountpoint = %mountpoint.display(),
        fsname = %fs.config().fsname,
        read_only = fs.config().read_only,
        "Mounting"
    );

    let target = mountpoint.to_path_buf();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(fuser::spawn_mount2(fs, &target, &options));
    });

    let session = match rx.recv_timeout(MOUNT_TIMEOUT) {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return Err(FsError::Mount(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => return Err(FsError::MountTimeout(MOUNT_TIMEOUT)),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(FsError::Mount(std::io::Error::other(
                "mount thread terminated unexpectedly",
            )));
        }
    };

    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
    })
}
