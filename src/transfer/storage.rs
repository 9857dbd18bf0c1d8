//! Ciphertext blob storage for Sealdrop.
//!
//! Blobs are stored in a directory tree keyed by ownership class, kind and id,
//! sharded by the first two characters of the id:
//! ```text
//! {base_path}/
//! ├── anonymous/
//! │   ├── message/
//! │   │   └── 3f/
//! │   │       └── 3f2a9c1e-5d2b-4b8e-9a61-0c7d8e9f1a2b
//! │   └── file/
//! └── user/
//!     ├── message/
//!     └── file/
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

use super::types::{OwnershipClass, TransferId, TransferKind};
use crate::{Result, SealdropError};

const CLASSES: [OwnershipClass; 2] = [OwnershipClass::Anonymous, OwnershipClass::User];
const KINDS: [TransferKind; 2] = [TransferKind::Message, TransferKind::File];

/// Filesystem store for ciphertext blobs.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
}

/// A blob found while walking the store.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub id: TransferId,
    pub kind: TransferKind,
    pub class: OwnershipClass,
    pub modified: SystemTime,
}

impl BlobStore {
    /// Create a store rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        Ok(Self { base_path })
    }

    /// Root directory of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Full path of a blob: `{base}/{class}/{kind}/{shard}/{id}`.
    pub fn blob_path(&self, id: TransferId, kind: TransferKind, class: OwnershipClass) -> PathBuf {
        let name = id.to_string();
        let shard = name[..2].to_string();
        self.base_path
            .join(class.as_str())
            .join(kind.as_str())
            .join(shard)
            .join(name)
    }

    /// Check whether a blob exists.
    pub async fn exists(&self, id: TransferId, kind: TransferKind, class: OwnershipClass) -> bool {
        fs::try_exists(self.blob_path(id, kind, class))
            .await
            .unwrap_or(false)
    }

    /// Stream `source` into a new blob.
    ///
    /// Exactly `expected_len` bytes must arrive. On any failure, including the
    /// returned future being dropped mid-copy, the partial file is removed.
    pub async fn save<R>(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
        source: R,
        expected_len: u64,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let pending = self
            .save_pending(id, kind, class, source, expected_len)
            .await?;
        Ok(pending.commit())
    }

    /// Stream `source` into a new blob that stays provisional.
    ///
    /// The returned [`PendingBlob`] removes the file when dropped unless
    /// [`PendingBlob::commit`] is called, so a caller can tie the blob's
    /// survival to a later step.
    pub async fn save_pending<R>(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
        source: R,
        expected_len: u64,
    ) -> Result<PendingBlob>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.blob_path(id, kind, class);
        let (mut file, guard) = create_blob_file(&path).await?;

        // One extra byte is enough to detect an oversized stream.
        let mut limited = source.take(expected_len.saturating_add(1));
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        if written != expected_len {
            return Err(SealdropError::Validation(format!(
                "ciphertext length mismatch: declared {expected_len} bytes, received {}",
                if written > expected_len {
                    format!("more than {expected_len}")
                } else {
                    written.to_string()
                }
            )));
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        debug!("Wrote {} bytes for blob {}", written, id);
        Ok(PendingBlob {
            guard,
            len: written,
        })
    }

    /// Open a blob for reading.
    ///
    /// With `self_delete` set the blob is gone from the store once the
    /// returned reader is dropped, whether or not it was read to the end.
    /// Returns `None` when the blob does not exist.
    pub async fn open(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
        self_delete: bool,
    ) -> Result<Option<BlobReader>> {
        let path = self.blob_path(id, kind, class);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();

        let pending_unlink = if self_delete {
            BlobReader::detach(path).await?
        } else {
            None
        };

        Ok(Some(BlobReader {
            file,
            len,
            consuming: self_delete,
            pending_unlink,
        }))
    }

    /// Delete a blob. Returns `false` if it did not exist.
    pub async fn delete(
        &self,
        id: TransferId,
        kind: TransferKind,
        class: OwnershipClass,
    ) -> Result<bool> {
        match fs::remove_file(self.blob_path(id, kind, class)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Walk the store and list every blob.
    ///
    /// Entries whose name is not a transfer id are skipped.
    pub async fn list_blobs(&self) -> Result<Vec<StoredBlob>> {
        let mut blobs = Vec::new();

        for class in CLASSES {
            for kind in KINDS {
                let kind_dir = self.base_path.join(class.as_str()).join(kind.as_str());
                let mut shards = match fs::read_dir(&kind_dir).await {
                    Ok(shards) => shards,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };

                while let Some(shard) = shards.next_entry().await? {
                    if !shard.file_type().await?.is_dir() {
                        continue;
                    }
                    let mut entries = fs::read_dir(shard.path()).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let Some(id) = entry
                            .file_name()
                            .to_str()
                            .and_then(|name| name.parse::<TransferId>().ok())
                        else {
                            continue;
                        };
                        // Read-once downloads and failed uploads unlink
                        // files while the walk is running.
                        let modified = match entry.metadata().await {
                            Ok(meta) => meta.modified()?,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        };
                        blobs.push(StoredBlob {
                            id,
                            kind,
                            class,
                            modified,
                        });
                    }
                }
            }
        }

        Ok(blobs)
    }

    /// Remove empty shard directories last modified at least `min_age` ago.
    pub async fn cleanup_empty_dirs(&self, min_age: Duration) -> Result<usize> {
        let mut removed = 0;

        for class in CLASSES {
            for kind in KINDS {
                let kind_dir = self.base_path.join(class.as_str()).join(kind.as_str());
                let Ok(mut shards) = fs::read_dir(&kind_dir).await else {
                    continue;
                };
                while let Some(shard) = shards.next_entry().await? {
                    let Ok(meta) = shard.metadata().await else {
                        continue;
                    };
                    let old_enough = meta
                        .modified()
                        .ok()
                        .and_then(|modified| modified.elapsed().ok())
                        .is_some_and(|age| age >= min_age);
                    if !meta.is_dir() || !old_enough {
                        continue;
                    }
                    // remove_dir refuses non-empty directories
                    if fs::remove_dir(shard.path()).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }
}

/// Attempts at creating a blob file when its shard directory vanishes.
const CREATE_ATTEMPTS: usize = 10;

/// Create a blob file and arm its removal guard.
///
/// The file is created synchronously so that no await point separates it
/// from its guard. A concurrent `cleanup_empty_dirs` may remove the freshly
/// created shard directory, in which case the directory is created again.
async fn create_blob_file(path: &Path) -> Result<(File, PartialBlob)> {
    let mut attempt = 1;
    loop {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => return Ok((File::from_std(file), PartialBlob::new(path.to_path_buf()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < CREATE_ATTEMPTS => {
                debug!("Shard directory of {:?} removed concurrently, retrying", path);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A fully written blob awaiting confirmation.
///
/// Dropping it, for example when the surrounding future is cancelled,
/// removes the file.
#[derive(Debug)]
pub struct PendingBlob {
    guard: PartialBlob,
    len: u64,
}

impl PendingBlob {
    /// Keep the blob. Returns its length.
    pub fn commit(mut self) -> u64 {
        self.guard.keep();
        self.len
    }

    /// Remove the blob now, reporting failure instead of logging it.
    /// Returns `false` if it was already gone.
    pub async fn discard(mut self) -> Result<bool> {
        let removed = fs::remove_file(&self.guard.path).await;
        self.guard.keep();
        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Removes a partially written blob unless `keep` is called.
#[derive(Debug)]
struct PartialBlob {
    path: PathBuf,
    keep: bool,
}

impl PartialBlob {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialBlob {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial blob {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial blob {:?}: {}", self.path, e),
        }
    }
}

/// Read handle over a stored blob.
///
/// In consuming mode the backing file is unlinked. On Unix this happens right
/// after open, and the open descriptor keeps the data readable until drop. On
/// other platforms the file is removed when the reader is dropped.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    len: u64,
    consuming: bool,
    pending_unlink: Option<PathBuf>,
}

impl BlobReader {
    #[cfg(unix)]
    async fn detach(path: PathBuf) -> Result<Option<PathBuf>> {
        match fs::remove_file(&path).await {
            Ok(()) => {}
            // A concurrent consuming reader unlinked it first; our descriptor is still valid.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(None)
    }

    #[cfg(not(unix))]
    async fn detach(path: PathBuf) -> Result<Option<PathBuf>> {
        Ok(Some(path))
    }

    /// Ciphertext length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether dropping this reader deletes the blob.
    pub fn is_consuming(&self) -> bool {
        self.consuming
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        if let Some(path) = self.pending_unlink.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove consumed blob {:?}: {}", path, e),
            }
        }
    }
}
