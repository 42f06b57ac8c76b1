//! Catalog of users, files and access rows, plus the on-disk file store.

pub mod memory;
pub mod service;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::MemoryCatalog;
pub use service::FileService;
pub use sqlite::SqliteCatalog;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file {filename} already exists for user {owner}")]
    AlreadyExists { owner: String, filename: String },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog write lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub owner: String,
}

pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage a transfer session needs: a catalog entry plus the bytes behind it.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Records `(owner, filename)` and grants the owner access to it.
    fn create_catalog_entry(&self, owner: &str, filename: &str) -> Result<(), StoreError>;

    fn delete_catalog_entry(&self, owner: &str, filename: &str) -> Result<(), StoreError>;

    async fn open_for_write(&self, owner: &str, filename: &str) -> io::Result<FileWriter>;

    async fn open_for_read(&self, owner: &str, filename: &str) -> io::Result<FileReader>;

    async fn remove_backing_file(&self, owner: &str, filename: &str) -> io::Result<()>;
}

/// May `subject` read `owner`'s `filename`?
pub trait AccessGate: Send + Sync {
    fn has_access(&self, owner: &str, subject: &str, filename: &str) -> Result<bool, StoreError>;
}

/// Persistent rows behind the file service. Mutations are serialised by
/// one write lock per catalog; reads take no lock.
pub trait Catalog: Send + Sync {
    /// Get-or-create.
    fn register_user(&self, username: &str) -> Result<(), StoreError>;

    fn users(&self) -> Result<Vec<String>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] for a duplicate pair.
    fn create_file(&self, owner: &str, filename: &str) -> Result<(), StoreError>;

    /// Removes the file row and every access row for it.
    fn delete_file(&self, owner: &str, filename: &str) -> Result<(), StoreError>;

    fn file_exists(&self, owner: &str, filename: &str) -> Result<bool, StoreError>;

    fn grant(&self, owner: &str, subject: &str, filename: &str) -> Result<(), StoreError>;

    fn revoke(&self, owner: &str, subject: &str, filename: &str) -> Result<(), StoreError>;

    fn has_access(&self, owner: &str, subject: &str, filename: &str) -> Result<bool, StoreError>;

    /// Files `subject` holds an access row for.
    fn files_for(&self, subject: &str) -> Result<Vec<FileRecord>, StoreError>;
}
