//! FUSE filesystem backed by a remote file service.
//!
//! The adapter presents one remote directory tree as a local filesystem.
//! Every kernel call becomes a short sequence of remote calls through the
//! [`RemoteClient`](remfs_client::RemoteClient) contract; nothing is cached
//! locally beyond the name tree the kernel needs to resolve inodes.
//!
//! # Usage
//!
//! ```ignore
//! use remfs_fuse::{MountConfig, RemoteFs, mount};
//!
//! let client = runtime.block_on(remfs_client::connect(&options))?;
//! let fs = RemoteFs::new(client, MountConfig::default())?;
//! let handle = mount(fs, mountpoint)?;
//! ```

pub mod attr;
pub mod bridge;
pub mod config;
pub mod dirstream;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod mount;
pub mod ops;

pub use attr::{SetAttrRequest, entry_attr, stat_to_attr};
pub use bridge::{Bridge, BridgeError, BridgeStats};
pub use config::MountConfig;
pub use dirstream::{DirEntry, DirStream};
pub use error::{Errno, FsError, FsResult, ToErrno, translate};
pub use filesystem::RemoteFs;
pub use handles::{DirHandle, HandleTable, OpenHandle, OpenHandleTable, RemoteFile};
pub use inode::{NodeTree, ROOT_INODE, StableAttr};
pub use mount::{MountHandle, mount, mount_options};
pub use ops::{Caller, NodeInfo, RemoteOps};
