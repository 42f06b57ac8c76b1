use tracing::{debug, error, info};

use super::{read_chunk, Fault, Peer, SessionState};
use crate::codec;
use crate::error::{ErrorKind, TransferError, TransferOutcome};
use crate::messages;
use crate::store::{AccessGate, FileReader, FileStore};

/// Server side of a download: serves `owner`'s file to `subject` in
/// fixed-size chunks once the receiver asks for them.
pub struct DownloadSession {
    subject: String,
    owner: String,
    filename: String,
    chunk_size: usize,
    reader: Option<FileReader>,
    fault: Option<Fault>,
    chunk_count: u64,
    state: SessionState,
}

impl DownloadSession {
    /// Checks access before anything else; a denied subject never causes
    /// the file to be opened.
    pub async fn open(
        subject: impl Into<String>,
        owner: impl Into<String>,
        filename: impl Into<String>,
        chunk_size: u32,
        store: &dyn FileStore,
        gate: &dyn AccessGate,
    ) -> Self {
        let mut session = Self {
            subject: subject.into(),
            owner: owner.into(),
            filename: filename.into(),
            chunk_size: chunk_size.max(1) as usize,
            reader: None,
            fault: None,
            chunk_count: 0,
            state: SessionState::Created,
        };

        session.fault = match gate.has_access(&session.owner, &session.subject, &session.filename) {
            Ok(true) => match store.open_for_read(&session.owner, &session.filename).await {
                Ok(reader) => {
                    session.reader = Some(reader);
                    None
                }
                Err(err) => Some(Fault::new(ErrorKind::Io, err.to_string())),
            },
            Ok(false) => Some(Fault::new(
                ErrorKind::AccessDenied,
                format!(
                    "{} may not read {}'s {}",
                    session.subject, session.owner, session.filename
                ),
            )),
            Err(err) => Some(Fault::new(ErrorKind::Storage, err.to_string())),
        };
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
        self.reader.is_some()
    }

    pub fn outcome(&self) -> TransferOutcome {
        match (self.state, self.error()) {
            (SessionState::Completed, _) => TransferOutcome::completed(self.chunk_count),
            (_, Some(kind)) => TransferOutcome::failed(self.chunk_count, kind),
            _ => TransferOutcome::failed(self.chunk_count, ErrorKind::Cancelled),
        }
    }

    /// Handshake. A session that failed to open reports it right away.
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
        if let Err(err) = peer.next(codec::ready(), false).await {
            self.fail(Fault::from(&err), peer).await;
        }
    }

    /// The receiver is ready: push the whole file, then the sentinel.
    pub async fn on_ready_request<P>(&mut self, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        match self.state {
            SessionState::Completed | SessionState::Serving => return,
            SessionState::Failed => {
                if let Some(fault) = self.fault.clone() {
                    self.fail(fault, peer).await;
                }
                return;
            }
            SessionState::Created | SessionState::Receiving => {}
        }
        if let Some(fault) = self.fault.clone() {
            self.fail(fault, peer).await;
            return;
        }

        self.state = SessionState::Serving;
        if let Err(err) = self.drain(peer).await {
            let fault = match err {
                TransferError::ChannelClosed => Fault::new(ErrorKind::Cancelled, err.to_string()),
                other => Fault::from(&other),
            };
            self.fail(fault, peer).await;
        }
    }

    async fn drain<P>(&mut self, peer: &mut P) -> Result<(), TransferError>
    where
        P: Peer + ?Sized,
    {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| TransferError::Protocol("no read handle".to_string()))?;

        loop {
            let chunk = read_chunk(reader, self.chunk_size).await?;
            let exhausted = chunk.len() < self.chunk_size;
            if !chunk.is_empty() {
                let len = chunk.len();
                peer.next(chunk, false).await?;
                self.chunk_count += 1;
                debug!(
                    filename = %self.filename,
                    chunk = self.chunk_count,
                    bytes = len,
                    "sent chunk"
                );
            }
            if exhausted {
                break;
            }
        }

        peer.next(codec::sentinel(), true).await?;
        self.reader = None;
        self.state = SessionState::Completed;
        info!(
            subject = %self.subject,
            owner = %self.owner,
            filename = %self.filename,
            chunks = self.chunk_count,
            "{}",
            messages::FILE_SENT
        );
        Ok(())
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

    async fn fail<P>(&mut self, fault: Fault, peer: &mut P)
    where
        P: Peer + ?Sized,
    {
        if self.state != SessionState::Failed {
            let fault = self.fault.get_or_insert(fault);
            error!(
                subject = %self.subject,
                owner = %self.owner,
                filename = %self.filename,
                kind = ?fault.kind,
                "download failed: {}",
                fault.detail
            );
            self.state = SessionState::Failed;
            self.reader = None;
        }

        let kind = self
            .fault
            .as_ref()
            .map(|fault| fault.kind)
            .unwrap_or(ErrorKind::Io);
        let message = match kind {
            ErrorKind::AccessDenied => messages::ACCESS_DENIED.to_string(),
            _ => messages::download_failed(&self.filename, &self.owner),
        };
        if let Err(err) = peer.error(kind, message).await {
            debug!("could not report download failure: {err}");
        }
    }
}
