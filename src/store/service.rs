use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::BufWriter};
use tracing::{debug, warn};

use super::{AccessGate, Catalog, FileReader, FileRecord, FileStore, FileWriter, StoreError};
use crate::messages;

/// Catalog plus a directory holding one `{owner}_{filename}` file per upload.
#[derive(Debug)]
pub struct FileService<C> {
    catalog: C,
    files_dir: PathBuf,
}

impl<C: Catalog> FileService<C> {
    pub fn new(catalog: C, files_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            files_dir: files_dir.into(),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn backing_path(&self, owner: &str, filename: &str) -> PathBuf {
        self.files_dir
            .join(messages::backing_file_name(owner, filename))
    }

    /// Registers the sanitised form of `username` and returns it.
    pub fn register(&self, username: &str) -> Result<String, StoreError> {
        let username = messages::sanitize_alphanumeric(username);
        if username.is_empty() {
            return Err(StoreError::InvalidName(messages::INVALID_USERNAME.to_string()));
        }
        self.catalog.register_user(&username)?;
        Ok(username)
    }

    pub fn client_list(&self) -> Result<Vec<String>, StoreError> {
        self.catalog.users()
    }

    pub fn list_files(&self, username: &str) -> Result<Vec<FileRecord>, StoreError> {
        self.catalog.files_for(username)
    }

    /// Grants `subject` access when the file exists or access is already
    /// held. Returns whether the subject ends up with access.
    pub fn create_acl_entry(
        &self,
        filename: &str,
        owner: &str,
        subject: &str,
    ) -> Result<bool, StoreError> {
        if self.catalog.has_access(owner, subject, filename)? {
            return Ok(true);
        }
        if !self.catalog.file_exists(owner, filename)? {
            return Ok(false);
        }
        self.catalog.grant(owner, subject, filename)?;
        Ok(true)
    }

    pub fn delete_acl_entry(
        &self,
        filename: &str,
        owner: &str,
        subject: &str,
    ) -> Result<(), StoreError> {
        self.catalog.revoke(owner, subject, filename)
    }

    /// Drops the catalog record, its access rows and the backing file.
    /// When the file cannot be removed an existing record and the owner's
    /// access are put back; grants to other users stay dropped.
    pub async fn delete_file(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        let existed = self.catalog.file_exists(owner, filename)?;
        self.catalog.delete_file(owner, filename)?;
        if let Err(err) = fs::remove_file(self.backing_path(owner, filename)).await {
            warn!(owner, filename, "could not remove backing file: {err}");
            if !existed {
                return Err(err.into());
            }
            if let Err(restore) = self.create_catalog_entry(owner, filename) {
                warn!(owner, filename, "could not restore catalog entry: {restore}");
            }
            return Err(err.into());
        }
        debug!(owner, filename, "file deleted");
        Ok(())
    }
}

#[async_trait]
impl<C: Catalog> FileStore for FileService<C> {
    fn create_catalog_entry(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        self.catalog.create_file(owner, filename)?;
        if let Err(err) = self.catalog.grant(owner, owner, filename) {
            // Leave no ownerless record behind.
            if let Err(cleanup) = self.catalog.delete_file(owner, filename) {
                warn!(owner, filename, "could not undo catalog entry: {cleanup}");
            }
            return Err(err);
        }
        Ok(())
    }

    fn delete_catalog_entry(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        self.catalog.delete_file(owner, filename)
    }

    async fn open_for_write(&self, owner: &str, filename: &str) -> io::Result<FileWriter> {
        fs::create_dir_all(&self.files_dir).await?;
        let file = fs::File::create(self.backing_path(owner, filename)).await?;
        Ok(Box::new(BufWriter::new(file)))
    }

    async fn open_for_read(&self, owner: &str, filename: &str) -> io::Result<FileReader> {
        let file = fs::File::open(self.backing_path(owner, filename)).await?;
        Ok(Box::new(file))
    }

    async fn remove_backing_file(&self, owner: &str, filename: &str) -> io::Result<()> {
        fs::remove_file(self.backing_path(owner, filename)).await
    }
}

impl<C: Catalog> AccessGate for FileService<C> {
    fn has_access(&self, owner: &str, subject: &str, filename: &str) -> Result<bool, StoreError> {
        self.catalog.has_access(owner, subject, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCatalog;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn service() -> (tempfile::TempDir, FileService<MemoryCatalog>) {
        let dir = tempfile::tempdir().unwrap();
        let service = FileService::new(MemoryCatalog::new(), dir.path().join("files"));
        (dir, service)
    }

    #[test]
    fn register_sanitises_and_rejects_empty_names() {
        let (_dir, service) = service();
        assert_eq!(service.register("al ice!").unwrap(), "alice");
        assert!(matches!(
            service.register("!!"),
            Err(StoreError::InvalidName(_))
        ));
        assert_eq!(service.client_list().unwrap(), vec!["alice"]);
    }

    #[test]
    fn catalog_entry_grants_owner_access() {
        let (_dir, service) = service();
        service.create_catalog_entry("alice", "notes").unwrap();
        assert!(service.has_access("alice", "alice", "notes").unwrap());
        assert!(!service.has_access("alice", "bob", "notes").unwrap());
    }

    #[test]
    fn acl_entries_need_an_existing_file() {
        let (_dir, service) = service();
        assert!(!service.create_acl_entry("notes", "alice", "bob").unwrap());

        service.create_catalog_entry("alice", "notes").unwrap();
        assert!(service.create_acl_entry("notes", "alice", "bob").unwrap());
        assert!(service.create_acl_entry("notes", "alice", "bob").unwrap());
        assert_eq!(
            service.list_files("bob").unwrap(),
            vec![FileRecord {
                filename: "notes".into(),
                owner: "alice".into()
            }]
        );

        service.delete_acl_entry("notes", "alice", "bob").unwrap();
        assert!(service.list_files("bob").unwrap().is_empty());
    }

    #[tokio::test]
    async fn written_files_can_be_read_back_and_deleted() {
        let (_dir, service) = service();
        service.create_catalog_entry("alice", "notes").unwrap();

        let mut writer = service.open_for_write("alice", "notes").await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        writer.shutdown().await.unwrap();
        assert!(service.backing_path("alice", "notes").ends_with("alice_notes"));

        let mut reader = service.open_for_read("alice", "notes").await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"payload");

        service.delete_file("alice", "notes").await.unwrap();
        assert!(!service.backing_path("alice", "notes").exists());
        assert!(service.list_files("alice").unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_unlink_keeps_the_catalog_record() {
        let (_dir, service) = service();
        service.create_catalog_entry("alice", "ghost").unwrap();
        service.create_acl_entry("ghost", "alice", "bob").unwrap();

        assert!(matches!(
            service.delete_file("alice", "ghost").await,
            Err(StoreError::Io(_))
        ));
        assert!(service.catalog().file_exists("alice", "ghost").unwrap());
        assert!(service.has_access("alice", "alice", "ghost").unwrap());
        assert!(!service.has_access("alice", "bob", "ghost").unwrap());
    }

    #[tokio::test]
    async fn deleting_an_unknown_file_creates_no_record() {
        let (_dir, service) = service();
        assert!(service.delete_file("alice", "missing").await.is_err());
        assert!(!service.catalog().file_exists("alice", "missing").unwrap());
    }
}
