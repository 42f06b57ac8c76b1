//! Doubles shared by the session and controller tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io,
    pin::Pin,
    sync::atomic::{AtomicUsize, Ordering},
    task::{Context, Poll},
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use super::Peer;
use crate::error::{ErrorKind, TransferError};
use crate::store::{
    AccessGate, Catalog, FileReader, FileService, FileStore, FileWriter, MemoryCatalog, StoreError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sent {
    Next { payload: Bytes, complete: bool },
    Complete,
    Error { kind: ErrorKind, message: String },
}

/// Peer that records everything a session emits.
#[derive(Debug, Default)]
pub(crate) struct RecordingPeer {
    pub sent: Vec<Sent>,
    /// Makes every send fail as if the channel had closed.
    pub closed: bool,
}

impl RecordingPeer {
    pub fn data(&self) -> Vec<Bytes> {
        self.sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Next {
                    payload,
                    complete: false,
                } if !payload.is_empty() => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(ErrorKind, String)> {
        self.sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Error { kind, message } => Some((*kind, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, sent: Sent) -> Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::ChannelClosed);
        }
        self.sent.push(sent);
        Ok(())
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    async fn next(&mut self, payload: Bytes, complete: bool) -> Result<(), TransferError> {
        self.record(Sent::Next { payload, complete })
    }

    async fn complete(&mut self) -> Result<(), TransferError> {
        self.record(Sent::Complete)
    }

    async fn error(&mut self, kind: ErrorKind, message: String) -> Result<(), TransferError> {
        self.record(Sent::Error { kind, message })
    }
}

/// Where a [`TestStore`] should break.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Breakage {
    #[default]
    None,
    OpenWrite,
    Write,
    OpenRead,
    /// Reads succeed for this many bytes, then fail.
    ReadAfter(usize),
    /// Catalog inserts fail.
    Catalog,
}

/// File service on a temporary directory with optional fault injection.
pub(crate) struct TestStore {
    pub service: FileService<MemoryCatalog>,
    pub breakage: Breakage,
    pub read_opens: AtomicUsize,
    _dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::broken(Breakage::None)
    }

    pub fn broken(breakage: Breakage) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let service = FileService::new(MemoryCatalog::new(), dir.path().join("files"));
        Self {
            service,
            breakage,
            read_opens: AtomicUsize::new(0),
            _dir: dir,
        }
    }

    /// Stores `contents` as `owner`'s `filename`, as a finished upload would.
    pub fn seed(&self, owner: &str, filename: &str, contents: &[u8]) {
        self.service
            .create_catalog_entry(owner, filename)
            .expect("catalog entry");
        std::fs::create_dir_all(self.service.files_dir()).expect("files dir");
        std::fs::write(self.service.backing_path(owner, filename), contents).expect("seed file");
    }

    pub fn contents(&self, owner: &str, filename: &str) -> Option<Vec<u8>> {
        std::fs::read(self.service.backing_path(owner, filename)).ok()
    }

    pub fn has_entry(&self, owner: &str, filename: &str) -> bool {
        self.service
            .catalog()
            .file_exists(owner, filename)
            .expect("catalog read")
    }
}

#[async_trait]
impl FileStore for TestStore {
    fn create_catalog_entry(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        if self.breakage == Breakage::Catalog {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "catalog unavailable",
            )));
        }
        self.service.create_catalog_entry(owner, filename)
    }

    fn delete_catalog_entry(&self, owner: &str, filename: &str) -> Result<(), StoreError> {
        self.service.delete_catalog_entry(owner, filename)
    }

    async fn open_for_write(&self, owner: &str, filename: &str) -> io::Result<FileWriter> {
        match self.breakage {
            Breakage::OpenWrite => Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only")),
            Breakage::Write => {
                // Create the file so rollback has something to remove.
                let _ = self.service.open_for_write(owner, filename).await?;
                Ok(Box::new(BrokenWriter))
            }
            _ => self.service.open_for_write(owner, filename).await,
        }
    }

    async fn open_for_read(&self, owner: &str, filename: &str) -> io::Result<FileReader> {
        self.read_opens.fetch_add(1, Ordering::SeqCst);
        match self.breakage {
            Breakage::OpenRead => Err(io::Error::new(io::ErrorKind::NotFound, "gone")),
            Breakage::ReadAfter(limit) => {
                let contents = std::fs::read(self.service.backing_path(owner, filename))?;
                let head = contents[..limit.min(contents.len())].to_vec();
                Ok(Box::new(io::Cursor::new(head).chain(BrokenReader)))
            }
            _ => self.service.open_for_read(owner, filename).await,
        }
    }

    async fn remove_backing_file(&self, owner: &str, filename: &str) -> io::Result<()> {
        self.service.remove_backing_file(owner, filename).await
    }
}

impl AccessGate for TestStore {
    fn has_access(&self, owner: &str, subject: &str, filename: &str) -> Result<bool, StoreError> {
        self.service.has_access(owner, subject, filename)
    }
}

struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct BrokenReader;

impl AsyncRead for BrokenReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "bad sector")))
    }
}
