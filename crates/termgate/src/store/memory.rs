//! In-memory metadata store. Lost on restart.

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::{StorageError, StorageResult};
use super::metadata::{GatewaySessionMetadata, MetadataStore};

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    rows: DashMap<String, GatewaySessionMetadata>,
    /// resume token → session id
    tokens: DashMap<String, String>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert(&self, metadata: &GatewaySessionMetadata) -> StorageResult<()> {
        if let Some(existing) = self.rows.get(&metadata.session_id)
            && existing.resume_token != metadata.resume_token
        {
            return Err(StorageError::TokenConflict {
                session_id: metadata.session_id.clone(),
            });
        }
        self.tokens
            .insert(metadata.resume_token.clone(), metadata.session_id.clone());
        self.rows
            .insert(metadata.session_id.clone(), metadata.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<GatewaySessionMetadata>> {
        Ok(self.rows.get(session_id).map(|row| row.clone()))
    }

    async fn find_by_resume_token(
        &self,
        resume_token: &str,
    ) -> StorageResult<Option<GatewaySessionMetadata>> {
        let Some(session_id) = self.tokens.get(resume_token).map(|id| id.clone()) else {
            return Ok(None);
        };
        self.get(&session_id).await
    }
}
