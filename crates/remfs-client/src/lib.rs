//! Client-side contract for the remfs remote storage service.
//!
//! The filesystem adapter talks to the service only through the
//! [`RemoteClient`] trait. This crate defines that trait, the records it
//! exchanges, the structured [`RemoteError`], and mount-time connection
//! setup. An in-process backend ([`MemoryRemote`]) implements the full
//! capability set for tests and the `mem://` scheme.
//!
//! # Usage
//!
//! ```ignore
//! use remfs_client::{ConnectOptions, connect};
//!
//! let client = connect(&ConnectOptions::new("mem://scratch")).await?;
//! let root = client.stat("/").await?;
//! ```

pub mod client;
pub mod connect;
pub mod error;
pub mod memory;
pub mod types;

pub use client::{Capability, RemoteClient};
pub use connect::{ConnectOptions, Credentials, TrustPolicy, connect};
pub use error::{RemoteError, RemoteResult};
pub use memory::MemoryRemote;
pub use types::{DirPage, FsStats, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, Stat, VolumeInfo, XAttr};
