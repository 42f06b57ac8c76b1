use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    task,
};
use tracing::debug;

use super::{Catalog, FileRecord, StoreError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY,
        filename TEXT NOT NULL,
        owner TEXT NOT NULL,
        UNIQUE(owner, filename)
    );
    CREATE TABLE IF NOT EXISTS acl (
        id INTEGER PRIMARY KEY,
        filename TEXT NOT NULL,
        owner TEXT NOT NULL,
        subject TEXT NOT NULL,
        UNIQUE(filename, owner, subject)
    );
";

/// Catalog backed by a SQLite file. Every operation opens its own
/// connection so the catalog can be shared across tasks without pooling.
#[derive(Debug)]
pub struct SqliteCatalog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SqliteCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let catalog = Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };
        catalog.connect()?.execute_batch(SCHEMA)?;
        debug!(path = %catalog.path.display(), "sqlite catalog ready");
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Ok(Connection::open(&self.path)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

/// Runs SQLite work with `block_in_place` on multi-threaded runtimes so the
/// other tasks on this worker move elsewhere. Current-thread runtimes run it
/// inline.
fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            task::block_in_place(work)
        }
        _ => work(),
    }
}

impl Catalog for SqliteCatalog {
    fn register_user(&self, username: &str) -> Result<(), StoreError> {
        run_blocking(|| -> Result<(), StoreError> {
            let _guard = self.lock()?;
            self.connect()?.execute(
                "INSERT OR IGNORE INTO users (username) VALUES (?1)",
                params![username],
            )?;
            Ok(())
        })
    }

    fn users(&self) -> Result<Vec<String>, StoreError> {
        run_blocking(|| -> Result<Vec<String>, StoreError> {
            let conn = self.connect()?;
            let mut stmt = conn.prepare("SELECT username FROM users ORDER BY username")?;
            let users = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(users)
        })
    }

    fn create_file(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        run_blocking(|| -> Result<(), StoreError> {
            let _guard = self.lock()?;
            let inserted = self.connect()?.execute(
                "INSERT INTO files (filename, owner) VALUES (?1, ?2)",
                params![filename, owner],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(err) if is_constraint_violation(&err) => Err(StoreError::AlreadyExists {
                    owner: owner.to_string(),
                    filename: filename.to_string(),
                }),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn delete_file(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        run_blocking(|| -> Result<(), StoreError> {
            let _guard = self.lock()?;
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM files WHERE filename = ?1 AND owner = ?2",
                params![filename, owner],
            )?;
            tx.execute(
                "DELETE FROM acl WHERE filename = ?1 AND owner = ?2",
                params![filename, owner],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn file_exists(&self, owner: &str, filename: &str) -> Result<bool, StoreError> {
        run_blocking(|| -> Result<bool, StoreError> {
            let found = self
                .connect()?
                .query_row(
                    "SELECT 1 FROM files WHERE filename = ?1 AND owner = ?2",
                    params![filename, owner],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn grant(&self, owner: &str, subject: &str, filename: &str) -> Result<(), StoreError> {
        run_blocking(|| -> Result<(), StoreError> {
            let _guard = self.lock()?;
            self.connect()?.execute(
                "INSERT OR IGNORE INTO acl (filename, owner, subject) VALUES (?1, ?2, ?3)",
                params![filename, owner, subject],
            )?;
            Ok(())
        })
    }

    fn revoke(&self, owner: &str, subject: &str, filename: &str) -> Result<(), StoreError> {
        run_blocking(|| -> Result<(), StoreError> {
            let _guard = self.lock()?;
            self.connect()?.execute(
                "DELETE FROM acl WHERE filename = ?1 AND owner = ?2 AND subject = ?3",
                params![filename, owner, subject],
            )?;
            Ok(())
        })
    }

    fn has_access(&self, owner: &str, subject: &str, filename: &str) -> Result<bool, StoreError> {
        run_blocking(|| -> Result<bool, StoreError> {
            let found = self
                .connect()?
                .query_row(
                    "SELECT 1 FROM acl WHERE filename = ?1 AND owner = ?2 AND subject = ?3",
                    params![filename, owner, subject],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn files_for(&self, subject: &str) -> Result<Vec<FileRecord>, StoreError> {
        run_blocking(|| -> Result<Vec<FileRecord>, StoreError> {
            let conn = self.connect()?;
            let mut stmt = conn.prepare(
                "SELECT filename, owner FROM acl WHERE subject = ?1 ORDER BY filename, owner",
            )?;
            let files = stmt
                .query_map(params![subject], |row| {
                    Ok(FileRecord {
                        filename: row.get(0)?,
                        owner: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(files)
        })
    }
}
