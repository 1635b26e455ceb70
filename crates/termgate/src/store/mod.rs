//! Storage for gateway session metadata.
//!
//! The gateway only sees the [`MetadataStore`] trait. `gateway.store_path`
//! selects the file backend; without it rows live in memory.

pub mod error;
pub mod file;
pub mod memory;
pub mod metadata;

pub use error::{StorageError, StorageResult};
pub use file::FileMetadataStore;
pub use memory::MemoryMetadataStore;
pub use metadata::{GatewaySessionMetadata, MetadataStore, ResourceLimits};
