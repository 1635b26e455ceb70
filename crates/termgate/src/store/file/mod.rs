//! File-based storage.
//!
//! Documents are JSON. Every write goes to a temp file first and is renamed
//! into place, so a crash never leaves a half-written document behind.

mod metadata;

use std::path::Path;

use tokio::fs;

use crate::store::error::{StorageError, StorageResult};

pub use metadata::FileMetadataStore;

/// Write `contents` to `tmp`, fsync, then rename over `path`.
pub(crate) async fn atomic_write_file(
    tmp: &Path,
    path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let mut file = fs::File::create(tmp)
        .await
        .map_err(|e| StorageError::file_io(tmp, e))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents)
        .await
        .map_err(|e| StorageError::file_io(tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| StorageError::file_io(tmp, e))?;
    drop(file);

    fs::rename(tmp, path)
        .await
        .map_err(|e| StorageError::file_io(path, e))
}
