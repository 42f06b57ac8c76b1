use dashmap::DashSet;
use std::sync::{Mutex, MutexGuard};

use super::{Catalog, FileRecord, StoreError};

type FileKey = (String, String);
type AclKey = (String, String, String);

/// Catalog kept in memory. Used by tests and by servers started without a
/// database path.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    users: DashSet<String>,
    files: DashSet<FileKey>,
    // (owner, filename, subject)
    acl: DashSet<AclKey>,
    write_lock: Mutex<()>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn file_key(owner: &str, filename: &str) -> FileKey {
    (owner.to_string(), filename.to_string())
}

fn acl_key(owner: &str, subject: &str, filename: &str) -> AclKey {
    (owner.to_string(), filename.to_string(), subject.to_string())
}

impl Catalog for MemoryCatalog {
    fn register_user(&self, username: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        self.users.insert(username.to_string());
        Ok(())
    }

    fn users(&self) -> Result<Vec<String>, StoreError> {
        let mut users: Vec<String> = self.users.iter().map(|user| user.key().clone()).collect();
        users.sort();
        Ok(users)
    }

    fn create_file(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        if !self.files.insert(file_key(owner, filename)) {
            return Err(StoreError::AlreadyExists {
                owner: owner.to_string(),
                filename: filename.to_string(),
            });
        }
        Ok(())
    }

    fn delete_file(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        self.files.remove(&file_key(owner, filename));
        self.acl
            .retain(|(acl_owner, acl_file, _)| !(acl_owner == owner && acl_file == filename));
        Ok(())
    }

    fn file_exists(&self, owner: &str, filename: &str) -> Result<bool, StoreError> {
        Ok(self.files.contains(&file_key(owner, filename)))
    }

    fn grant(&self, owner: &str, subject: &str, filename: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        self.acl.insert(acl_key(owner, subject, filename));
        Ok(())
    }

    fn revoke(&self, owner: &str, subject: &str, filename: &str) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        self.acl.remove(&acl_key(owner, subject, filename));
        Ok(())
    }

    fn has_access(&self, owner: &str, subject: &str, filename: &str) -> Result<bool, StoreError> {
        Ok(self.acl.contains(&acl_key(owner, subject, filename)))
    }

    fn files_for(&self, subject: &str) -> Result<Vec<FileRecord>, StoreError> {
        let mut files: Vec<FileRecord> = self
            .acl
            .iter()
            .filter(|entry| entry.key().2 == subject)
            .map(|entry| {
                let (owner, filename, _) = entry.key();
                FileRecord {
                    filename: filename.clone(),
                    owner: owner.clone(),
                }
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_files_are_rejected() {
        let catalog = MemoryCatalog::new();
        catalog.create_file("alice", "notes").unwrap();
        assert!(matches!(
            catalog.create_file("alice", "notes"),
            Err(StoreError::AlreadyExists { .. })
        ));
        catalog.create_file("bob", "notes").unwrap();
    }

    #[test]
    fn deleting_a_file_drops_its_access_rows() {
        let catalog = MemoryCatalog::new();
        catalog.create_file("alice", "notes").unwrap();
        catalog.grant("alice", "bob", "notes").unwrap();
        catalog.grant("alice", "bob", "other").unwrap();

        catalog.delete_file("alice", "notes").unwrap();

        assert!(!catalog.file_exists("alice", "notes").unwrap());
        assert!(!catalog.has_access("alice", "bob", "notes").unwrap());
        assert!(catalog.has_access("alice", "bob", "other").unwrap());
    }

    #[test]
    fn files_for_lists_granted_files_only() {
        let catalog = MemoryCatalog::new();
        catalog.grant("alice", "bob", "b").unwrap();
        catalog.grant("carol", "bob", "a").unwrap();
        catalog.grant("alice", "dave", "c").unwrap();

        let files = catalog.files_for("bob").unwrap();
        assert_eq!(
            files,
            vec![
                FileRecord {
                    filename: "a".into(),
                    owner: "carol".into()
                },
                FileRecord {
                    filename: "b".into(),
                    owner: "alice".into()
                },
            ]
        );
    }

    #[test]
    fn register_is_idempotent() {
        let catalog = MemoryCatalog::new();
        catalog.register_user("bob").unwrap();
        catalog.register_user("alice").unwrap();
        catalog.register_user("bob").unwrap();
        assert_eq!(catalog.users().unwrap(), vec!["alice", "bob"]);
    }
}
