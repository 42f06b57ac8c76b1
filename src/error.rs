use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use crate::streaming::StreamError;
use crate::RpcError;

/// Category of a transfer failure as seen by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    Storage,
    Io,
    Protocol,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("access denied")]
    AccessDenied,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] RpcError),

    /// Failure reported by the other side of the channel.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::AccessDenied => ErrorKind::AccessDenied,
            TransferError::Storage(_) => ErrorKind::Storage,
            TransferError::Io(_) => ErrorKind::Io,
            TransferError::Protocol(_) => ErrorKind::Protocol,
            TransferError::ChannelClosed
            | TransferError::Timeout
            | TransferError::Transport(_) => ErrorKind::Cancelled,
            TransferError::Remote { kind, .. } => *kind,
        }
    }
}

impl From<StreamError<TransferError>> for TransferError {
    fn from(err: StreamError<TransferError>) -> Self {
        match err {
            StreamError::Timeout => TransferError::Timeout,
            StreamError::Inner(inner) => inner,
        }
    }
}

/// Final result of one transfer as observed by the party that ran it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    pub chunk_count: u64,
    pub error_kind: Option<ErrorKind>,
}

impl TransferOutcome {
    pub fn completed(chunk_count: u64) -> Self {
        Self {
            success: true,
            chunk_count,
            error_kind: None,
        }
    }

    pub fn failed(chunk_count: u64, kind: ErrorKind) -> Self {
        Self {
            success: false,
            chunk_count,
            error_kind: Some(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_the_peer_kind() {
        let err = TransferError::Remote {
            kind: ErrorKind::AccessDenied,
            message: "Access Denied.".into(),
        };
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(err.to_string(), "Access Denied.");
    }

    #[test]
    fn lost_peers_count_as_cancellation() {
        assert_eq!(TransferError::ChannelClosed.kind(), ErrorKind::Cancelled);
        assert_eq!(TransferError::Timeout.kind(), ErrorKind::Cancelled);
        assert_eq!(
            TransferError::from(StreamError::Timeout).kind(),
            ErrorKind::Cancelled
        );
    }
}
