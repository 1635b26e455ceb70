//! File-backed gateway metadata store.
//!
//! Directory structure:
//! ```text
//! {dir}/
//!   {session_id}.json          # one row per session
//!   tokens/
//!     {sha256(resume_token)}   # contains the session id
//! ```
//!
//! Resume tokens are only ever stored hashed in file names, never in clear
//! outside the row itself.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;

use super::atomic_write_file;
use crate::store::error::{StorageError, StorageResult};
use crate::store::metadata::{GatewaySessionMetadata, MetadataStore, is_valid_session_id};

#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn row_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn tokens_dir(&self) -> PathBuf {
        self.dir.join("tokens")
    }

    fn token_path(&self, resume_token: &str) -> PathBuf {
        let digest = Sha256::digest(resume_token.as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.tokens_dir().join(name)
    }

    async fn ensure_dirs(&self) -> StorageResult<()> {
        let tokens = self.tokens_dir();
        fs::create_dir_all(&tokens)
            .await
            .map_err(|e| StorageError::file_io(&tokens, e))
    }

    async fn read_row(&self, path: &Path) -> StorageResult<Option<GatewaySessionMetadata>> {
        let contents = match fs::read(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(path, e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| StorageError::file_deserialization(path, e.to_string()))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn upsert(&self, metadata: &GatewaySessionMetadata) -> StorageResult<()> {
        if !is_valid_session_id(&metadata.session_id) {
            return Err(StorageError::serialization(format!(
                "unsafe session id: {:?}",
                metadata.session_id
            )));
        }
        self.ensure_dirs().await?;

        let path = self.row_path(&metadata.session_id);
        if let Some(existing) = self.read_row(&path).await?
            && existing.resume_token != metadata.resume_token
        {
            return Err(StorageError::TokenConflict {
                session_id: metadata.session_id.clone(),
            });
        }

        // Index first: a row is never visible without its token entry.
        let token_path = self.token_path(&metadata.resume_token);
        atomic_write_file(
            &token_path.with_extension("tmp"),
            &token_path,
            metadata.session_id.as_bytes(),
        )
        .await?;

        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        atomic_write_file(&path.with_extension("json.tmp"), &path, &json).await?;

        tracing::debug!(session_id = %metadata.session_id, path = %path.display(), "saved session metadata");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<GatewaySessionMetadata>> {
        if !is_valid_session_id(session_id) {
            return Ok(None);
        }
        self.read_row(&self.row_path(session_id)).await
    }

    async fn find_by_resume_token(
        &self,
        resume_token: &str,
    ) -> StorageResult<Option<GatewaySessionMetadata>> {
        let path = self.token_path(resume_token);
        let session_id = match fs::read_to_string(&path).await {
            Ok(id) => id,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        let Some(row) = self.get(session_id.trim()).await? else {
            return Ok(None);
        };
        // Guard against a stale index entry pointing at a reused id.
        if row.resume_token != resume_token {
            return Ok(None);
        }
        Ok(Some(row))
    }
}
