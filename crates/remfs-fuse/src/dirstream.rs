//! Lazy directory enumeration over the remote marker protocol.
//!
//! A [`DirStream`] holds at most one pending entry name. Each
//! [`next`](DirStream::next) fetches full attributes for that entry and then
//! asks the backend for the single entry after the current marker, so memory
//! stays constant regardless of directory size.

use crate::error::FsResult;
use crate::inode::join_path;
use remfs_client::{RemoteClient, Stat};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

/// One enumerated directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Remote device id of the entry.
    pub id: u64,
    pub mode: u32,
    pub name: String,
    /// Full record the entry was built from.
    pub stat: Stat,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Marker to resume from on the next load. `None` once the backend is drained.
    marker: Option<String>,
    /// Name of the next entry to yield.
    pending: Option<String>,
}

/// Cursor over one remote directory.
pub struct DirStream {
    client: Arc<dyn RemoteClient>,
    path: String,
    cursor: Mutex<Cursor>,
}

impl std::fmt::Debug for DirStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirStream")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DirStream {
    /// Verifies `path` exists and prefetches the first entry.
    pub async fn open(client: Arc<dyn RemoteClient>, path: String) -> FsResult<Self> {
        client.stat(&path).await?;
        let stream = Self {
            client,
            path,
            cursor: Mutex::new(Cursor {
                marker: Some(String::new()),
                pending: None,
            }),
        };
        {
            let mut cursor = stream.cursor.lock().await;
            stream.load(&mut cursor).await?;
        }
        Ok(stream)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Requests the single entry after the current marker.
    async fn load(&self, cursor: &mut Cursor) -> FsResult<()> {
        let Some(marker) = cursor.marker.as_deref() else {
            cursor.pending = None;
            return Ok(());
        };
        let page = self.client.list_dir(&self.path, marker, true, 1).await?;
        match page.entries.into_iter().next() {
            None => {
                trace!(path = %self.path, "Directory stream exhausted");
                cursor.marker = None;
                cursor.pending = None;
            }
            Some(entry) => {
                // An entry without a continuation marker is the last one.
                cursor.marker = (!page.marker.is_empty()).then_some(page.marker);
                cursor.pending = Some(entry.file_name);
            }
        }
        Ok(())
    }

    /// Returns true while an entry is buffered.
    pub async fn has_next(&self) -> bool {
        self.cursor.lock().await.pending.is_some()
    }

    /// Yields the buffered entry and prefetches the following one.
    ///
    /// Returns `None` once exhausted. The boolean is true when the returned
    /// entry was the last. On error the cursor is left unchanged.
    pub async fn next(&self) -> FsResult<Option<(DirEntry, bool)>> {
        let mut cursor = self.cursor.lock().await;
        let Some(name) = cursor.pending.clone() else {
            return Ok(None);
        };
        let stat = self.client.get_attr(&join_path(&self.path, &name)).await?;

        let mut advanced = Cursor {
            marker: cursor.marker.clone(),
            pending: None,
        };
        self.load(&mut advanced).await?;
        *cursor = advanced;

        let entry = DirEntry {
            id: stat.dev,
            mode: stat.mode,
            name,
            stat,
        };
        Ok(Some((entry, cursor.pending.is_none())))
    }

    /// Releases the stream. The backend keeps no cursor state, so this is a no-op.
    pub fn close(&self) {}
}
