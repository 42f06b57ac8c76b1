//! Per-transfer state machines.
//!
//! Server sessions ([`UploadSession`], [`DownloadSession`]) are driven one
//! event at a time by the controller. Client counterparts run a whole
//! transfer from a single call.

pub mod client;
pub mod download;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::channel::ChannelSender;
use crate::error::{ErrorKind, TransferError};

pub use client::{ClientDownloadReceiver, ClientUploadSender};
pub use download::DownloadSession;
pub use upload::UploadSession;

/// Outbound half of a channel as seen by a session.
#[async_trait]
pub trait Peer: Send {
    async fn next(&mut self, payload: Bytes, complete: bool) -> Result<(), TransferError>;

    async fn complete(&mut self) -> Result<(), TransferError>;

    async fn error(&mut self, kind: ErrorKind, message: String) -> Result<(), TransferError>;
}

#[async_trait]
impl Peer for ChannelSender {
    async fn next(&mut self, payload: Bytes, complete: bool) -> Result<(), TransferError> {
        self.send_next(payload, complete).await
    }

    async fn complete(&mut self) -> Result<(), TransferError> {
        self.send_complete().await
    }

    async fn error(&mut self, kind: ErrorKind, message: String) -> Result<(), TransferError> {
        self.send_error(kind, message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Receiving,
    Serving,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// The error a session latched. Re-emitted unchanged on every later event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
    pub kind: ErrorKind,
    pub detail: String,
}

impl Fault {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<&TransferError> for Fault {
    fn from(err: &TransferError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

/// Reads until `chunk_size` bytes are buffered or the source is exhausted.
/// A result shorter than `chunk_size` therefore means end of file.
pub(crate) async fn read_chunk<R>(reader: &mut R, chunk_size: usize) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = BytesMut::zeroed(chunk_size);
    let mut filled = 0;
    while filled < chunk_size {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer.freeze())
}
