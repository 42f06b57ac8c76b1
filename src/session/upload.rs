use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::{Fault, Peer, SessionState};
use crate::codec;
use crate::error::{ErrorKind, TransferError, TransferOutcome};
use crate::messages;
use crate::store::{FileStore, FileWriter};

/// Server side of an upload: persists the chunks a file owner sends.
///
/// The catalog entry and write handle are acquired when the session is
/// opened. A failure there is latched and only reported once the peer
/// interacts with the session.
pub struct UploadSession {
    owner: String,
    filename: String,
    store: Arc<dyn FileStore>,
    writer: Option<FileWriter>,
    /// Catalog entry created by this session.
    registered: bool,
    /// Backing file created by this session.
    created_file: bool,
    fault: Option<Fault>,
    chunk_count: u64,
    state: SessionState,
}

impl UploadSession {
    pub async fn open(
        owner: impl Into<String>,
        filename: impl Into<String>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        let mut session = Self {
            owner: owner.into(),
            filename: filename.into(),
            store,
            writer: None,
            registered: false,
            created_file: false,
            fault: None,
            chunk_count: 0,
            state: SessionState::Created,
        };

        match session
            .store
            .create_catalog_entry(&session.owner, &session.filename)
        {
            Ok(()) => {
                session.registered = true;
                match session
                    .store
                    .open_for_write(&session.owner, &session.filename)
                    .await
                {
                    Ok(writer) => {
                        session.writer = Some(writer);
                        session.created_file = true;
                    }
                    Err(err) => session.fault = Some(Fault::new(ErrorKind::Io, err.to_string())),
                }
            }
            Err(err) => session.fault = Some(Fault::new(ErrorKind::Storage, err.to_string())),
        }

        if let Some(fault) = &session.fault {
            warn!(
                owner = %session.owner,
                filename = %session.filename,
                "upload cannot start: {}",
                fault.detail
            );
        }
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.fault.as_ref().map(|fault| fault.kind)
    }

    pub fn has_open_handle(&self) -> bool {
        self.writer.is_some()
    }

    pub fn outcome(&self) -> TransferOutcome {
        match (self.state, self.error()) {
            (SessionState::Completed, _) => TransferOutcome::completed(self.chunk_count),
            (_, Some(kind)) => TransferOutcome::failed(self.chunk_count, kind),
            _ => TransferOutcome::failed(self.chunk_count, ErrorKind::Cancelled),
        }
    }

    /// Handshake: tells the sender the store is ready for bytes.
    pub async fn on_subscribe<P>(&mut self, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        if self.state != SessionState::Created {
            return;
        }
        if let Some(fault) = self.fault.clone() {
            self.fail(fault, peer).await;
            return;
        }
        self.state = SessionState::Receiving;
        if let Err(err) = peer.next(codec::ready(), false).await {
            self.fail(Fault::from(&err), peer).await;
        }
    }

    pub async fn on_data<P>(&mut self, payload: Bytes, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        if let Some(fault) = self.fault.clone() {
            self.fail(fault, peer).await;
            return;
        }
        if self.state == SessionState::Completed {
            debug!(owner = %self.owner, filename = %self.filename, "ignoring data after completion");
            return;
        }
        self.state = SessionState::Receiving;
        if payload.is_empty() {
            return;
        }

        let Some(writer) = self.writer.as_mut() else {
            let fault = Fault::new(ErrorKind::Io, "no write handle");
            self.fail(fault, peer).await;
            return;
        };
        match writer.write_all(&payload).await {
            Ok(()) => {
                self.chunk_count += 1;
                debug!(
                    owner = %self.owner,
                    filename = %self.filename,
                    chunk = self.chunk_count,
                    bytes = payload.len(),
                    "received chunk"
                );
            }
            Err(err) => self.fail(Fault::new(ErrorKind::Io, err.to_string()), peer).await,
        }
    }

    pub async fn on_stream_end<P>(&mut self, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        if let Some(fault) = self.fault.clone() {
            self.fail(fault, peer).await;
            return;
        }
        if self.state == SessionState::Completed {
            return;
        }

        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                self.fail(Fault::new(ErrorKind::Io, err.to_string()), peer).await;
                return;
            }
        }
        self.state = SessionState::Completed;
        info!(
            owner = %self.owner,
            filename = %self.filename,
            chunks = self.chunk_count,
            "{}",
            messages::file_created(&self.filename)
        );
        if let Err(err) = peer.complete().await {
            debug!("sender left before the completion ack: {err}");
        }
    }

    pub async fn on_error<P>(&mut self, cause: TransferError, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        if self.state == SessionState::Completed {
            debug!("ignoring error after completion: {cause}");
            return;
        }
        self.fail(Fault::from(&cause), peer).await;
    }

    /// Latches `fault` on first use, then (re-)reports the latched fault.
    async fn fail<P>(&mut self, fault: Fault, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        if self.state != SessionState::Failed {
            let fault = self.fault.get_or_insert(fault).clone();
            error!(
                owner = %self.owner,
                filename = %self.filename,
                kind = ?fault.kind,
                "upload failed: {}",
                fault.detail
            );
            self.state = SessionState::Failed;
            self.rollback().await;
        }

        let kind = self
            .fault
            .as_ref()
            .map(|fault| fault.kind)
            .unwrap_or(ErrorKind::Io);
        let message = messages::upload_failed(&self.filename, &self.owner);
        if let Err(err) = peer.error(kind, message).await {
            debug!("could not report upload failure: {err}");
        }
    }

    /// Undoes only what this session created.
    async fn rollback(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if self.registered {
            self.registered = false;
            if let Err(err) = self
                .store
                .delete_catalog_entry(&self.owner, &self.filename)
            {
                warn!(owner = %self.owner, filename = %self.filename, "catalog rollback failed: {err}");
            }
        }
        if self.created_file {
            self.created_file = false;
            if let Err(err) = self
                .store
                .remove_backing_file(&self.owner, &self.filename)
                .await
            {
                warn!(owner = %self.owner, filename = %self.filename, "file rollback failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{Breakage, RecordingPeer, Sent, TestStore};

    async fn open(store: &Arc<TestStore>) -> UploadSession {
        UploadSession::open("alice", "notes", store.clone() as Arc<dyn FileStore>).await
    }

    #[tokio::test]
    async fn chunks_are_persisted_in_order() {
        let store = Arc::new(TestStore::new());
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        session.on_subscribe(&mut peer).await;
        session.on_data(Bytes::from_static(b"hello "), &mut peer).await;
        session.on_data(Bytes::from_static(b"world"), &mut peer).await;
        session.on_stream_end(&mut peer).await;

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.chunk_count(), 2);
        assert!(!session.has_open_handle());
        assert_eq!(
            peer.sent,
            vec![
                Sent::Next {
                    payload: Bytes::new(),
                    complete: false
                },
                Sent::Complete
            ]
        );
        assert_eq!(store.contents("alice", "notes").unwrap(), b"hello world");
        assert!(store.has_entry("alice", "notes"));
        assert_eq!(session.outcome(), TransferOutcome::completed(2));
    }

    #[tokio::test]
    async fn empty_upload_completes_with_catalog_entry() {
        let store = Arc::new(TestStore::new());
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        session.on_subscribe(&mut peer).await;
        session.on_stream_end(&mut peer).await;

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.chunk_count(), 0);
        assert!(store.has_entry("alice", "notes"));
        assert_eq!(store.contents("alice", "notes").unwrap(), b"");
    }

    #[tokio::test]
    async fn failed_open_rolls_back_catalog_entry_on_first_event() {
        let store = Arc::new(TestStore::broken(Breakage::OpenWrite));
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        // Latched but not yet reported.
        assert_eq!(session.error(), Some(ErrorKind::Io));
        assert_eq!(session.state(), SessionState::Created);
        assert!(store.has_entry("alice", "notes"));

        session.on_subscribe(&mut peer).await;

        assert_eq!(session.state(), SessionState::Failed);
        assert!(!store.has_entry("alice", "notes"));
        assert_eq!(
            peer.errors(),
            vec![(
                ErrorKind::Io,
                "Upload failed for file notes and user alice.".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn write_failure_rolls_back_and_repeats_the_same_error() {
        let store = Arc::new(TestStore::broken(Breakage::Write));
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        session.on_subscribe(&mut peer).await;
        session.on_data(Bytes::from_static(b"chunk"), &mut peer).await;
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!store.has_entry("alice", "notes"));
        assert!(store.contents("alice", "notes").is_none());

        session.on_data(Bytes::from_static(b"more"), &mut peer).await;
        session.on_stream_end(&mut peer).await;

        let errors = peer.errors();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|error| error == &errors[0]));
        assert_eq!(session.chunk_count(), 0);
        assert_eq!(session.outcome(), TransferOutcome::failed(0, ErrorKind::Io));
    }

    #[tokio::test]
    async fn duplicate_upload_keeps_the_existing_file() {
        let store = Arc::new(TestStore::new());
        store.seed("alice", "notes", b"original");
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        session.on_subscribe(&mut peer).await;

        assert_eq!(session.error(), Some(ErrorKind::Storage));
        assert!(store.has_entry("alice", "notes"));
        assert_eq!(store.contents("alice", "notes").unwrap(), b"original");
        assert_eq!(peer.errors()[0].0, ErrorKind::Storage);
    }

    #[tokio::test]
    async fn peer_error_mid_upload_removes_partial_data() {
        let store = Arc::new(TestStore::new());
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        session.on_subscribe(&mut peer).await;
        session.on_data(Bytes::from_static(b"partial"), &mut peer).await;
        session
            .on_error(
                TransferError::Remote {
                    kind: ErrorKind::Io,
                    message: "client read failed".into(),
                },
                &mut peer,
            )
            .await;

        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.has_open_handle());
        assert!(!store.has_entry("alice", "notes"));
        assert!(store.contents("alice", "notes").is_none());
    }

    #[tokio::test]
    async fn catalog_failure_is_a_storage_fault() {
        let store = Arc::new(TestStore::broken(Breakage::Catalog));
        let mut peer = RecordingPeer::default();
        let mut session = open(&store).await;

        assert!(!session.has_open_handle());
        session.on_data(Bytes::from_static(b"x"), &mut peer).await;

        assert_eq!(session.outcome(), TransferOutcome::failed(0, ErrorKind::Storage));
    }
}
